use chrono::Utc;
use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const ENTRY_POINT_FILE: &str = "main.py";
const REQUIREMENTS_FILE: &str = "requirements.txt";
const README_FILE: &str = "README.md";
const SAFE_REQUIREMENTS_FILE: &str = "temp_requirements.txt";
const CACHE_FILE_NAME: &str = "dependency_cache.json";

// Packages the shared host environment needs to keep running; app
// requirement lines naming one of these are never forwarded to pip.
const PROTECTED_PACKAGES: &[&str] = &[
    "pyqt5",
    "pyqt5-qt5",
    "pyqt5-sip",
    "pyqt5-tools",
    "importlib-metadata",
    "setuptools",
    "pip",
];

const VERSION_SPECIFIERS: &[&str] = &["==", ">=", "<=", ">", "<", "!="];

#[derive(Parser, Debug)]
#[command(name = "hangar", version, about = "Hangar CLI")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Setup {
        #[arg(long, default_value_t = false)]
        defaults: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    List,
    Check {
        identity: String,
    },
    Install {
        identity: String,
    },
    Launch {
        identity: String,
    },
    Readme {
        identity: String,
    },
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    Doctor,
    Paths,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Edit,
    Validate,
    Apply,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    Show,
    Clear,
}

#[derive(Debug, Error)]
enum HangarError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    paths: Paths,
    python: Python,
    external_apps: Vec<String>,
    custom_names: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Paths {
    apps_root: String,
    cache_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Python {
    interpreter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            paths: Paths::default(),
            python: Python::default(),
            external_apps: Vec::new(),
            custom_names: BTreeMap::new(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            apps_root: "~/hangar-apps".to_string(),
            cache_file: "".to_string(),
        }
    }
}

impl Default for Python {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum AppOrigin {
    Primary,
    External,
}

impl AppOrigin {
    fn as_str(&self) -> &'static str {
        match self {
            AppOrigin::Primary => "primary",
            AppOrigin::External => "external",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct AppRecord {
    identity: String,
    display_name: String,
    path: PathBuf,
    entry_point: PathBuf,
    requirements_file: PathBuf,
    readme_file: PathBuf,
    origin: AppOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    requirements_hash: String,
    last_installed: String,
    skipped_packages: Vec<String>,
}

type Registry = BTreeMap<String, AppRecord>;
type DependencyCache = BTreeMap<String, CacheEntry>;

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

trait PipRunner {
    fn run(&self, interpreter: &str, args: &[String]) -> Result<CommandOutput, io::Error>;
}

struct RealPipRunner;

impl PipRunner for RealPipRunner {
    fn run(&self, interpreter: &str, args: &[String]) -> Result<CommandOutput, io::Error> {
        let output = Command::new(interpreter).args(args).output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[derive(Debug)]
struct StatusLog {
    quiet: bool,
    phases: Vec<String>,
}

impl StatusLog {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            phases: Vec::new(),
        }
    }

    fn emit(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.quiet {
            println!("{message}");
        }
        self.phases.push(message);
    }
}

fn main() -> Result<(), HangarError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);
    let runner = RealPipRunner;

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Setup { defaults, yes } => handle_setup(&ctx, defaults, yes),
        Commands::List => handle_list(&ctx),
        Commands::Check { identity } => handle_check(&ctx, &identity, &runner),
        Commands::Install { identity } => handle_install(&ctx, &identity, &runner),
        Commands::Launch { identity } => handle_launch(&ctx, &identity, &runner),
        Commands::Readme { identity } => handle_readme(&ctx, &identity),
        Commands::Cache { command } => handle_cache(&ctx, command),
        Commands::Doctor => handle_doctor(&ctx, &runner),
        Commands::Paths => handle_paths(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("HANGAR_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("HANGAR_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("hangar");
    base
}

fn ensure_parent(path: &Path) -> Result<(), HangarError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<Config, HangarError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

fn read_config_from_str(content: &str) -> Result<Config, HangarError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != 1 {
        return Err(HangarError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    Ok(cfg)
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

fn resolve_apps_root(cfg: &Config) -> PathBuf {
    PathBuf::from(expand_path(&cfg.paths.apps_root))
}

fn resolve_cache_path(ctx: &Context, cfg: &Config) -> PathBuf {
    if !cfg.paths.cache_file.trim().is_empty() {
        return PathBuf::from(expand_path(&cfg.paths.cache_file));
    }
    ctx.config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(CACHE_FILE_NAME)
}

fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), HangarError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{pid}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "hangar".to_string())
    ));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn hex_encode(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn fingerprint_file(path: &Path) -> Option<String> {
    let mut file = fs::File::open(path).ok()?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 4096];
    loop {
        let read = file.read(&mut buffer).ok()?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Some(hex_encode(&hasher.finalize()))
}

// Deterministic digest so external identities stay stable across rescans.
fn stable_path_digest(path: &Path) -> String {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let digest = sha256_hex(canonical.to_string_lossy().as_bytes());
    digest[..12].to_string()
}

fn load_cache(path: &Path) -> DependencyCache {
    let Ok(content) = fs::read_to_string(path) else {
        return DependencyCache::new();
    };
    serde_json::from_str(&content).unwrap_or_default()
}

fn save_cache(path: &Path, cache: &DependencyCache) -> Result<(), HangarError> {
    let content = serde_json::to_string_pretty(cache)?;
    write_atomic_text_file(path, &content)
}

fn package_name(line: &str) -> String {
    let mut end = line.len();
    for token in VERSION_SPECIFIERS {
        if let Some(idx) = line.find(token) {
            end = end.min(idx);
        }
    }
    line[..end].trim().to_string()
}

fn scan_apps(cfg: &Config) -> Registry {
    let mut registry = Registry::new();
    let apps_root = resolve_apps_root(cfg);
    let _ = fs::create_dir_all(&apps_root);
    if let Ok(entries) = fs::read_dir(&apps_root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            insert_app(&mut registry, cfg, &path, AppOrigin::Primary);
        }
    }
    for external in &cfg.external_apps {
        let path = PathBuf::from(expand_path(external));
        insert_app(&mut registry, cfg, &path, AppOrigin::External);
    }
    registry
}

fn insert_app(registry: &mut Registry, cfg: &Config, dir: &Path, origin: AppOrigin) {
    let entry_point = dir.join(ENTRY_POINT_FILE);
    if !entry_point.exists() {
        return;
    }
    let Some(name) = dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return;
    };
    let identity = match origin {
        AppOrigin::Primary => name.clone(),
        AppOrigin::External => format!("ext_{name}_{}", stable_path_digest(dir)),
    };
    let display_name = cfg
        .custom_names
        .get(&identity)
        .cloned()
        .unwrap_or_else(|| name.clone());
    registry.insert(
        identity.clone(),
        AppRecord {
            identity,
            display_name,
            path: dir.to_path_buf(),
            entry_point,
            requirements_file: dir.join(REQUIREMENTS_FILE),
            readme_file: dir.join(README_FILE),
            origin,
        },
    );
}

fn package_installed<R: PipRunner>(
    cfg: &Config,
    runner: &R,
    name: &str,
) -> Result<bool, io::Error> {
    let args = vec![
        "-m".to_string(),
        "pip".to_string(),
        "show".to_string(),
        "-q".to_string(),
        name.to_string(),
    ];
    let output = runner.run(&cfg.python.interpreter, &args)?;
    Ok(output.success())
}

fn check_requirements_needed<R: PipRunner>(
    cfg: &Config,
    cache: &DependencyCache,
    app: &AppRecord,
    runner: &R,
) -> (bool, String) {
    if !app.requirements_file.exists() {
        return (false, "no requirements file".to_string());
    }
    // An unreadable file must not block launch; skip the check instead.
    let Some(current_hash) = fingerprint_file(&app.requirements_file) else {
        return (false, "could not read requirements file".to_string());
    };
    let cache_key = app.path.to_string_lossy().to_string();
    let cached_hash = cache
        .get(&cache_key)
        .map(|entry| entry.requirements_hash.as_str());
    if cached_hash != Some(current_hash.as_str()) {
        return (true, "requirements file changed".to_string());
    }
    // Hash matched, but the environment may have drifted; verify each
    // declared package is still present.
    let content = match fs::read_to_string(&app.requirements_file) {
        Ok(content) => content,
        Err(err) => return (true, format!("error checking packages: {err}")),
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let name = package_name(line);
        if name.is_empty() {
            continue;
        }
        match package_installed(cfg, runner, &name) {
            Ok(true) => {}
            Ok(false) => return (true, format!("package {name} not installed")),
            Err(err) => return (true, format!("error checking packages: {err}")),
        }
    }
    (false, "all requirements satisfied".to_string())
}

fn filter_requirements(
    requirements_file: &Path,
) -> Result<(PathBuf, Vec<String>), HangarError> {
    let content = fs::read_to_string(requirements_file)
        .map_err(|err| HangarError::Process(format!("error processing requirements: {err}")))?;
    let mut safe_lines = Vec::new();
    let mut skipped_packages = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            safe_lines.push(line.to_string());
            continue;
        }
        let name = package_name(line).to_lowercase();
        if PROTECTED_PACKAGES.contains(&name.as_str()) {
            skipped_packages.push(line.to_string());
            continue;
        }
        safe_lines.push(line.to_string());
    }
    let safe_path = requirements_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(SAFE_REQUIREMENTS_FILE);
    let mut body = String::new();
    for line in &safe_lines {
        body.push_str(line);
        body.push('\n');
    }
    fs::write(&safe_path, body)
        .map_err(|err| HangarError::Process(format!("error processing requirements: {err}")))?;
    Ok((safe_path, skipped_packages))
}

fn install_requirements<R: PipRunner>(
    cfg: &Config,
    cache_path: &Path,
    cache: &mut DependencyCache,
    app: &AppRecord,
    runner: &R,
    status: &mut StatusLog,
) -> Result<String, HangarError> {
    let (safe_path, skipped_packages) = filter_requirements(&app.requirements_file)?;
    if !skipped_packages.is_empty() {
        status.emit(format!(
            "Skipped protected packages: {}",
            skipped_packages.join(", ")
        ));
    }
    let args = vec![
        "-m".to_string(),
        "pip".to_string(),
        "install".to_string(),
        "-r".to_string(),
        safe_path.to_string_lossy().to_string(),
    ];
    let result = runner.run(&cfg.python.interpreter, &args);
    let _ = fs::remove_file(&safe_path);
    let output =
        result.map_err(|err| HangarError::Process(format!("failed to run pip: {err}")))?;
    if !output.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            return Err(HangarError::Process(stderr));
        }
        // pip occasionally reports resolution errors on stdout.
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !stdout.is_empty() {
            return Err(HangarError::Process(stdout));
        }
        return Err(HangarError::Process(format!(
            "pip install failed with status {}",
            output.status_code
        )));
    }
    // The cache records the fingerprint of the original file, not the
    // filtered one, so edits to protected lines still trigger a reinstall.
    let fingerprint = fingerprint_file(&app.requirements_file).ok_or_else(|| {
        HangarError::Process("could not read requirements file after install".to_string())
    })?;
    let cache_key = app.path.to_string_lossy().to_string();
    cache.insert(
        cache_key,
        CacheEntry {
            requirements_hash: fingerprint,
            last_installed: Utc::now().to_rfc3339(),
            skipped_packages: skipped_packages.clone(),
        },
    );
    save_cache(cache_path, cache)?;
    let mut message = "requirements installed successfully".to_string();
    if !skipped_packages.is_empty() {
        message.push_str(&format!(
            " (skipped {} protected packages)",
            skipped_packages.len()
        ));
    }
    Ok(message)
}

fn spawn_app(cfg: &Config, app: &AppRecord) -> Result<(), HangarError> {
    let mut cmd = Command::new(&cfg.python.interpreter);
    cmd.arg(ENTRY_POINT_FILE);
    cmd.current_dir(&app.path);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    // Fire and forget; the child is never awaited.
    cmd.spawn().map_err(|err| {
        HangarError::Process(format!("failed to launch {}: {err}", app.display_name))
    })?;
    Ok(())
}

fn find_app<'a>(registry: &'a Registry, identity: &str) -> Result<&'a AppRecord, HangarError> {
    registry
        .get(identity)
        .ok_or_else(|| HangarError::Process(format!("app '{identity}' not found")))
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), HangarError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Edit => {
            if !ctx.config_path.exists() {
                ensure_parent(&ctx.config_path)?;
                fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            }
            let editor = env::var("VISUAL").ok().or_else(|| env::var("EDITOR").ok());
            if let Some(editor) = editor {
                let status = Command::new(editor)
                    .arg(&ctx.config_path)
                    .status()
                    .map_err(|err| {
                        HangarError::Process(format!("failed to launch editor: {err}"))
                    })?;
                if !status.success() {
                    return Err(HangarError::Process("editor exited with error".to_string()));
                }
                output(ctx, json!({"path": ctx.config_path}))
            } else {
                Err(HangarError::Process(
                    "EDITOR is not set; please edit the config file manually".to_string(),
                ))
            }
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Apply => {
            let cfg = match read_config(&ctx.config_path) {
                Ok(cfg) => cfg,
                Err(err) => {
                    return Err(HangarError::Config(format!(
                        "config is invalid. Please edit {} and try again. ({})",
                        ctx.config_path.display(),
                        err
                    )));
                }
            };
            let apps_root = resolve_apps_root(&cfg);
            fs::create_dir_all(&apps_root)?;
            let cache_path = resolve_cache_path(ctx, &cfg);
            ensure_parent(&cache_path)?;
            output(
                ctx,
                json!({"apps_root": apps_root, "cache_file": cache_path}),
            )
        }
    }
}

fn handle_setup(ctx: &Context, defaults: bool, yes: bool) -> Result<(), HangarError> {
    if ctx.json && !defaults {
        return Err(HangarError::Process(
            "--json is only supported with `hangar setup --defaults`".to_string(),
        ));
    }
    if !defaults && !io::stdin().is_terminal() {
        return Err(HangarError::Process(
            "interactive setup requires a TTY; re-run with `--defaults` for non-interactive mode"
                .to_string(),
        ));
    }

    let config_exists = ctx.config_path.exists();
    let base_cfg = if config_exists {
        read_config(&ctx.config_path)?
    } else {
        read_config_from_str(DEFAULT_CONFIG_YAML)?
    };

    if defaults {
        if !config_exists {
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
        }
        let apps_root = resolve_apps_root(&base_cfg);
        fs::create_dir_all(&apps_root)?;
        return output(
            ctx,
            json!({
                "config_path": ctx.config_path,
                "created": !config_exists,
                "apps_root": apps_root,
            }),
        );
    }

    let theme = ColorfulTheme::default();
    println!("Hangar keeps every launchable app in one root directory.");
    let apps_root = Input::<String>::with_theme(&theme)
        .with_prompt("Apps root directory")
        .default(base_cfg.paths.apps_root.clone())
        .interact_text()?;
    println!("The interpreter is used both for pip and for launching apps.");
    let interpreter = Input::<String>::with_theme(&theme)
        .with_prompt("Python interpreter")
        .default(base_cfg.python.interpreter.clone())
        .interact_text()?;

    let mut cfg = base_cfg;
    cfg.paths.apps_root = apps_root;
    cfg.python.interpreter = interpreter;

    let write = yes
        || Confirm::with_theme(&theme)
            .with_prompt(format!("Write config to {}?", ctx.config_path.display()))
            .default(true)
            .interact()?;
    if !write {
        println!("Setup aborted; nothing written.");
        return Ok(());
    }
    let yaml = serde_yaml::to_string(&cfg)?;
    write_atomic_text_file(&ctx.config_path, &yaml)?;
    fs::create_dir_all(resolve_apps_root(&cfg))?;
    println!("Config written to {}", ctx.config_path.display());
    Ok(())
}

fn handle_list(ctx: &Context) -> Result<(), HangarError> {
    let cfg = read_config(&ctx.config_path)?;
    let registry = scan_apps(&cfg);
    if ctx.json {
        let apps: Vec<&AppRecord> = registry.values().collect();
        return output(ctx, json!({"apps": apps, "count": apps.len()}));
    }
    if registry.is_empty() {
        println!("No apps found.");
        return Ok(());
    }
    for app in registry.values() {
        println!(
            "{:<32} {:<8} {}",
            app.identity,
            app.origin.as_str(),
            app.path.display()
        );
    }
    println!("Found {} apps", registry.len());
    Ok(())
}

fn handle_check<R: PipRunner>(
    ctx: &Context,
    identity: &str,
    runner: &R,
) -> Result<(), HangarError> {
    let cfg = read_config(&ctx.config_path)?;
    let registry = scan_apps(&cfg);
    let app = find_app(&registry, identity)?;
    let cache = load_cache(&resolve_cache_path(ctx, &cfg));
    let (needs_install, reason) = check_requirements_needed(&cfg, &cache, app, runner);
    output(
        ctx,
        json!({
            "identity": identity,
            "needs_install": needs_install,
            "reason": reason,
        }),
    )
}

fn handle_install<R: PipRunner>(
    ctx: &Context,
    identity: &str,
    runner: &R,
) -> Result<(), HangarError> {
    let cfg = read_config(&ctx.config_path)?;
    let registry = scan_apps(&cfg);
    let app = find_app(&registry, identity)?;
    if !app.requirements_file.exists() {
        return output(
            ctx,
            json!({
                "identity": identity,
                "installed": false,
                "message": "no requirements file",
            }),
        );
    }
    let cache_path = resolve_cache_path(ctx, &cfg);
    let mut cache = load_cache(&cache_path);
    let mut status = StatusLog::new(ctx.json);
    let message = install_requirements(&cfg, &cache_path, &mut cache, app, runner, &mut status)?;
    output(
        ctx,
        json!({
            "identity": identity,
            "installed": true,
            "message": message,
            "phases": status.phases,
        }),
    )
}

fn handle_launch<R: PipRunner>(
    ctx: &Context,
    identity: &str,
    runner: &R,
) -> Result<(), HangarError> {
    let cfg = read_config(&ctx.config_path)?;
    let registry = scan_apps(&cfg);
    let app = find_app(&registry, identity)?;
    let cache_path = resolve_cache_path(ctx, &cfg);
    let mut cache = load_cache(&cache_path);
    let mut status = StatusLog::new(ctx.json);

    if app.requirements_file.exists() {
        let (needs_install, reason) = check_requirements_needed(&cfg, &cache, app, runner);
        if needs_install {
            status.emit(format!(
                "Installing requirements for {} ({reason})",
                app.display_name
            ));
            let message =
                install_requirements(&cfg, &cache_path, &mut cache, app, runner, &mut status)?;
            status.emit(format!("Requirements updated: {message}"));
        } else {
            status.emit(format!("Requirements OK: {reason}"));
        }
    }

    status.emit(format!("Launching {}...", app.display_name));
    spawn_app(&cfg, app)?;
    status.emit(format!("Launched {}", app.display_name));

    output(
        ctx,
        json!({
            "identity": identity,
            "launched": true,
            "phases": status.phases,
        }),
    )
}

fn handle_readme(ctx: &Context, identity: &str) -> Result<(), HangarError> {
    let cfg = read_config(&ctx.config_path)?;
    let registry = scan_apps(&cfg);
    let app = find_app(&registry, identity)?;
    if !app.readme_file.exists() {
        if ctx.json {
            return output(ctx, json!({"identity": identity, "exists": false}));
        }
        println!("No README.md file found for this application.");
        return Ok(());
    }
    let content = fs::read_to_string(&app.readme_file)?;
    if ctx.json {
        return output(
            ctx,
            json!({
                "identity": identity,
                "exists": true,
                "path": app.readme_file,
                "content": content,
            }),
        );
    }
    print!("{content}");
    Ok(())
}

fn handle_cache(ctx: &Context, command: CacheCommand) -> Result<(), HangarError> {
    let cfg = read_config(&ctx.config_path)?;
    let cache_path = resolve_cache_path(ctx, &cfg);
    match command {
        CacheCommand::Show => {
            let cache = load_cache(&cache_path);
            output(
                ctx,
                json!({
                    "path": cache_path,
                    "entries": serde_json::to_value(&cache)?,
                }),
            )
        }
        CacheCommand::Clear => {
            let existed = cache_path.exists();
            if existed {
                fs::remove_file(&cache_path)?;
            }
            output(ctx, json!({"path": cache_path, "cleared": existed}))
        }
    }
}

fn handle_doctor<R: PipRunner>(ctx: &Context, runner: &R) -> Result<(), HangarError> {
    let cfg = read_config(&ctx.config_path)?;
    let mut checks = BTreeMap::new();

    let interpreter_ok = which::which(&cfg.python.interpreter).is_ok();
    checks.insert("interpreter".to_string(), interpreter_ok);

    let pip_args = vec![
        "-m".to_string(),
        "pip".to_string(),
        "--version".to_string(),
    ];
    let pip_ok = interpreter_ok
        && runner
            .run(&cfg.python.interpreter, &pip_args)
            .map(|out| out.success())
            .unwrap_or(false);
    checks.insert("pip".to_string(), pip_ok);

    let apps_root = resolve_apps_root(&cfg);
    let apps_root_ok = fs::create_dir_all(&apps_root)
        .and_then(|_| {
            let test_path = apps_root.join(".hangar_write_test");
            fs::write(&test_path, b"ok")?;
            fs::remove_file(&test_path)?;
            Ok(())
        })
        .is_ok();
    checks.insert("apps_root_writable".to_string(), apps_root_ok);

    let cache_path = resolve_cache_path(ctx, &cfg);
    let cache_ok = match fs::read_to_string(&cache_path) {
        Ok(content) => serde_json::from_str::<DependencyCache>(&content).is_ok(),
        Err(_) => true,
    };
    checks.insert("cache_readable".to_string(), cache_ok);

    let ok = interpreter_ok && pip_ok && apps_root_ok && cache_ok;
    let error = if ok {
        None
    } else if !interpreter_ok {
        Some(format!(
            "interpreter '{}' is not available",
            cfg.python.interpreter
        ))
    } else if !pip_ok {
        Some("pip is not available through the configured interpreter".to_string())
    } else if !apps_root_ok {
        Some("apps root is not writable".to_string())
    } else {
        Some("dependency cache is corrupt".to_string())
    };

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error: error.clone(),
        };
        print_json(&payload)?;
        return Ok(());
    }

    for (name, passed) in &checks {
        println!("{}: {}", name, if *passed { "ok" } else { "fail" });
    }
    if let Some(message) = error {
        return Err(HangarError::Process(message));
    }
    Ok(())
}

fn handle_paths(ctx: &Context) -> Result<(), HangarError> {
    let config_exists = ctx.config_path.exists();
    let cfg = if config_exists {
        read_config(&ctx.config_path)?
    } else {
        read_config_from_str(DEFAULT_CONFIG_YAML)?
    };
    output(
        ctx,
        json!({
            "config_path": ctx.config_path,
            "config_exists": config_exists,
            "apps_root": resolve_apps_root(&cfg),
            "cache_file": resolve_cache_path(ctx, &cfg),
            "external_apps": cfg.external_apps,
        }),
    )
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), HangarError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), HangarError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
