use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use admin_console::config::{ConfigError, ConsoleConfig, normalize_api_url};
use admin_console::context::{AppContext, ContextError};
use admin_console::error::ApiError;
use admin_console::guard::{GuardDecision, resolve};
use admin_console::permissions::{Permission, has_permission, permissions_of};
use admin_console::presenter::{NoticeLevel, Presenter};
use admin_console::users::{ListParams, ProfileUpdate, UserDraft, UserStatus};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("startup failed: {0}")]
    Context(#[from] ContextError),
    #[error("{}", .0.user_message())]
    Api(#[from] ApiError),
    #[error("login failed: {0}")]
    Login(String),
    #[error("not logged in; run `admin-cli login` first")]
    NotLoggedIn,
    #[error("unknown permission `{0}`")]
    UnknownPermission(String),
    #[error("reading stdin failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "admin-cli", about = "Admin console from the command line")]
struct Cli {
    /// API base URL. Overrides `ADMIN_API_URL`.
    #[arg(long)]
    base_url: Option<String>,

    /// Use the in-process mock backend. Overrides `ADMIN_USE_REAL_API`.
    #[arg(long, default_value_t = false)]
    mock: bool,

    /// Where the session is persisted. Overrides `ADMIN_STORAGE_DIR`.
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long, default_value = "admin")]
        username: String,
        /// Read from stdin when omitted.
        #[arg(long, env = "ADMIN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    Logout,
    Whoami {
        /// Ask the server instead of reading the stored profile.
        #[arg(long, default_value_t = false)]
        remote: bool,
    },
    /// Evaluate a console route against the current session.
    Route {
        path: String,
        /// Destination remembered by an earlier redirect.
        #[arg(long)]
        from: Option<String>,
    },
    /// Check a permission such as `user:delete` for the signed-in user.
    Can {
        permission: String,
    },
    Users(UsersCommand),
    Password {
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
    },
    Profile(ProfileArgs),
}

#[derive(Args, Debug)]
struct UsersCommand {
    #[command(subcommand)]
    command: UsersSubcommand,
}

#[derive(Subcommand, Debug)]
enum UsersSubcommand {
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 10)]
        page_size: u32,
    },
    Get {
        id: String,
    },
    Create(DraftArgs),
    Update {
        id: String,
        #[command(flatten)]
        draft: DraftArgs,
    },
    Delete {
        id: String,
    },
}

#[derive(Args, Debug)]
struct DraftArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long, default_value = "user")]
    role: String,
    #[arg(long, value_enum, default_value_t = StatusArg::Active)]
    status: StatusArg,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum StatusArg {
    Active,
    Inactive,
}

impl From<DraftArgs> for UserDraft {
    fn from(args: DraftArgs) -> Self {
        Self {
            name: args.name,
            email: args.email,
            phone: args.phone,
            role: args.role,
            status: match args.status {
                StatusArg::Active => UserStatus::Active,
                StatusArg::Inactive => UserStatus::Inactive,
            },
        }
    }
}

#[derive(Args, Debug)]
struct ProfileArgs {
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    avatar_url: Option<String>,
    #[arg(long)]
    remark: Option<String>,
}

impl From<ProfileArgs> for ProfileUpdate {
    fn from(args: ProfileArgs) -> Self {
        Self {
            display_name: args.display_name,
            email: args.email,
            phone_number: args.phone,
            avatar_url: args.avatar_url,
            remark: args.remark,
        }
    }
}

/// Notices go to stderr so stdout stays machine-readable.
struct CliPresenter;

impl Presenter for CliPresenter {
    fn notify(&self, level: NoticeLevel, message: &str) {
        let tag = match level {
            NoticeLevel::Success => "ok",
            NoticeLevel::Info => "info",
            NoticeLevel::Error => "error",
        };
        eprintln!("[{tag}] {message}");
    }

    fn navigate(&self, route: &str) {
        eprintln!("[redirect] {route}");
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let cli = Cli::parse();
    let config = apply_overrides(ConsoleConfig::from_env()?, &cli)?;
    let ctx = AppContext::from_config(&config, Arc::new(CliPresenter))?;

    match cli.command {
        Command::Login { username, password } => run_login(&ctx, &username, password).await,
        Command::Logout => {
            ctx.auth.logout().await;
            CliPresenter.notify(NoticeLevel::Success, "Logged out");
            Ok(())
        }
        Command::Whoami { remote } => run_whoami(&ctx, remote).await,
        Command::Route { path, from } => {
            let decision = resolve(&path, &ctx.session.snapshot(), from.as_deref());
            print_json(&decision_json(&path, &decision))
        }
        Command::Can { permission } => {
            let permission = Permission::parse(&permission).ok_or(CliError::UnknownPermission(permission))?;
            let granted = has_permission(ctx.session.profile().as_ref(), permission);
            print_json(&json!({ "permission": permission.as_str(), "granted": granted }))
        }
        Command::Users(users) => run_users(&ctx, users).await,
        Command::Password { old, new } => {
            ctx.users.update_password(&old, &new).await?;
            CliPresenter.notify(NoticeLevel::Success, "Password updated");
            Ok(())
        }
        Command::Profile(args) => {
            let profile = ctx.users.update_profile(&args.into()).await?;
            print_json(&serde_json::to_value(profile)?)
        }
    }
}

fn apply_overrides(mut config: ConsoleConfig, cli: &Cli) -> Result<ConsoleConfig, CliError> {
    if let Some(url) = &cli.base_url {
        config.api_url = normalize_api_url("--base-url", url)?;
    }
    if cli.mock {
        config.use_real_api = false;
    }
    if let Some(dir) = &cli.storage_dir {
        config.storage_dir.clone_from(dir);
    }
    Ok(config)
}

async fn run_login(ctx: &AppContext, username: &str, password: Option<String>) -> Result<(), CliError> {
    let password = match password {
        Some(password) => password,
        None => {
            eprint!("password: ");
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_owned()
        }
    };

    let outcome = ctx.session.login(username, &password).await;
    if !outcome.success {
        return Err(CliError::Login(outcome.message.unwrap_or_default()));
    }
    CliPresenter.notify(NoticeLevel::Success, "Login successful");
    print_json(&json!({ "profile": ctx.session.profile() }))
}

async fn run_whoami(ctx: &AppContext, remote: bool) -> Result<(), CliError> {
    if !ctx.session.is_authenticated() {
        return Err(CliError::NotLoggedIn);
    }
    let profile = if remote { Some(ctx.users.current().await?) } else { ctx.session.profile() };
    let permissions: Vec<&str> = profile
        .as_ref()
        .map(permissions_of)
        .unwrap_or_default()
        .into_iter()
        .map(Permission::as_str)
        .collect();
    print_json(&json!({ "profile": profile, "permissions": permissions }))
}

async fn run_users(ctx: &AppContext, users: UsersCommand) -> Result<(), CliError> {
    match users.command {
        UsersSubcommand::List { page, page_size } => {
            let page = ctx.users.list(ListParams { page, page_size }).await?;
            print_json(&serde_json::to_value(page)?)
        }
        UsersSubcommand::Get { id } => {
            let user = ctx.users.get(&id).await?;
            print_json(&serde_json::to_value(user)?)
        }
        UsersSubcommand::Create(args) => {
            let user = ctx.users.create(&args.into()).await?;
            print_json(&serde_json::to_value(user)?)
        }
        UsersSubcommand::Update { id, draft } => {
            let user = ctx.users.update(&id, &draft.into()).await?;
            print_json(&serde_json::to_value(user)?)
        }
        UsersSubcommand::Delete { id } => {
            ctx.users.delete(&id).await?;
            CliPresenter.notify(NoticeLevel::Success, "User deleted");
            Ok(())
        }
    }
}

fn decision_json(path: &str, decision: &GuardDecision) -> Value {
    match decision {
        GuardDecision::Allow => json!({ "path": path, "decision": "allow" }),
        GuardDecision::Redirect { to, from } => {
            json!({ "path": path, "decision": "redirect", "to": to, "from": from })
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("valid arguments")
    }

    #[test]
    fn flags_override_environment_config() {
        let cli = parse(&["admin-cli", "--mock", "--base-url", "https://api.test/v1/", "--storage-dir", "/tmp/s", "logout"]);
        let config = apply_overrides(ConsoleConfig::default(), &cli).unwrap();
        assert!(!config.use_real_api);
        assert_eq!(config.api_url, "https://api.test/v1");
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/s"));
    }

    #[test]
    fn bad_base_url_is_config_error() {
        let cli = parse(&["admin-cli", "--base-url", "nope", "logout"]);
        assert!(matches!(apply_overrides(ConsoleConfig::default(), &cli), Err(CliError::Config(_))));
    }

    #[test]
    fn draft_args_map_to_user_draft() {
        let cli = parse(&[
            "admin-cli", "users", "update", "7", "--name", "Li Wei", "--email", "li@example.com", "--status", "inactive",
        ]);
        let Command::Users(UsersCommand { command: UsersSubcommand::Update { id, draft } }) = cli.command else {
            panic!("expected users update");
        };
        let draft = UserDraft::from(draft);
        assert_eq!(id, "7");
        assert_eq!(draft.role, "user");
        assert_eq!(draft.status, UserStatus::Inactive);
    }

    #[test]
    fn redirect_decision_renders_target() {
        let decision = GuardDecision::Redirect { to: "/login".to_owned(), from: Some("/users".to_owned()) };
        let rendered = decision_json("/users", &decision);
        assert_eq!(rendered["decision"], "redirect");
        assert_eq!(rendered["to"], "/login");
        assert_eq!(rendered["from"], "/users");
    }
}
