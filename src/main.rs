mod accounts;
mod config;
mod debounce;
mod dedupe;
mod error;
mod event_log;
mod http;
mod instance;
mod login;
mod storage;
mod urls;

use std::io::{BufRead, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use crate::accounts::{AccountStore, ThemeStore};
use crate::config::Config;
use crate::debounce::Debouncer;
use crate::error::{AuthError, AuthResult};
use crate::event_log::{AuditEvent, EventLog};
use crate::http::{HttpClients, PostJsonClient};
use crate::instance::{
    check_instance, load_instance_feed, CheckStatus, InstanceCache, InstanceDirectory,
    InstanceResolver,
};
use crate::login::{ChallengeWidget, Credentials, LoginFlow, LoginPage, LoginState};
use crate::storage::{FileKeyValueStore, KeyValueStore};

/// Reads a secret: `(env var, prompt)` -> value.
type SecretReader = Arc<dyn Fn(&str, &str) -> AuthResult<String> + Send + Sync>;

const USAGE: &str = "sbauth - multi-account login client for Spacebar instances

Usage:
  sbauth list                          List stored accounts and the current one
  sbauth check [<instance>]            Resolve and remember an instance
                                       (reads instances from stdin without argument)
  sbauth instances                     List instances from the configured feed
  sbauth login <login> [options]       Log in and store the account
      --instance <instance>            Instance to log in to (default: last checked)
      --captcha <key>                  Solved captcha token
      --page <url>                     Login page URL carrying instance=/goback=
  sbauth switch <identity>             Make a stored account current
  sbauth profile <identity> [--username <name>] [--avatar <ref>]
  sbauth dedupe                        Merge duplicate accounts
  sbauth theme [<name>]                Show or set the theme
  sbauth help                          Show this help";
const LOGIN_USAGE: &str =
    "usage: sbauth login <login> [--instance <instance>] [--captcha <key>] [--page <url>]";
const PROFILE_USAGE: &str =
    "usage: sbauth profile <identity> [--username <name>] [--avatar <ref>]";

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Help,
    List,
    Check(Option<String>),
    Instances,
    Login {
        login: String,
        instance: Option<String>,
        captcha: Option<String>,
        page: Option<String>,
    },
    Switch(String),
    Profile {
        identity: String,
        username: Option<String>,
        avatar: Option<String>,
    },
    Dedupe,
    Theme(Option<String>),
}

impl CliCommand {
    fn parse(args: &[String]) -> AuthResult<Self> {
        let Some(first) = args.first() else {
            return Ok(Self::List);
        };
        let usage = |text: &str| AuthError::Usage(text.to_string());

        match first.as_str() {
            "-h" | "--help" | "help" => Ok(Self::Help),
            "list" | "ls" => {
                if args.len() != 1 {
                    return Err(usage("usage: sbauth list"));
                }
                Ok(Self::List)
            }
            "check" => match args.len() {
                1 => Ok(Self::Check(None)),
                2 => Ok(Self::Check(Some(args[1].clone()))),
                _ => Err(usage("usage: sbauth check [<instance>]")),
            },
            "instances" => {
                if args.len() != 1 {
                    return Err(usage("usage: sbauth instances"));
                }
                Ok(Self::Instances)
            }
            "login" => {
                let Some(login) = args.get(1).filter(|value| !value.starts_with("--")) else {
                    return Err(usage(LOGIN_USAGE));
                };
                let mut instance = None;
                let mut captcha = None;
                let mut page = None;
                let mut i = 2;
                while i < args.len() {
                    let slot = match args[i].as_str() {
                        "--instance" => &mut instance,
                        "--captcha" => &mut captcha,
                        "--page" => &mut page,
                        _ => return Err(usage(LOGIN_USAGE)),
                    };
                    i += 1;
                    let value = args.get(i).ok_or_else(|| usage(LOGIN_USAGE))?;
                    *slot = Some(value.clone());
                    i += 1;
                }
                Ok(Self::Login {
                    login: login.clone(),
                    instance,
                    captcha,
                    page,
                })
            }
            "switch" => {
                if args.len() != 2 {
                    return Err(usage("usage: sbauth switch <identity>"));
                }
                Ok(Self::Switch(args[1].clone()))
            }
            "profile" => {
                let Some(identity) = args.get(1) else {
                    return Err(usage(PROFILE_USAGE));
                };
                let mut username = None;
                let mut avatar = None;
                let mut i = 2;
                while i < args.len() {
                    let slot = match args[i].as_str() {
                        "--username" => &mut username,
                        "--avatar" => &mut avatar,
                        _ => return Err(usage(PROFILE_USAGE)),
                    };
                    i += 1;
                    let value = args.get(i).ok_or_else(|| usage(PROFILE_USAGE))?;
                    *slot = Some(value.clone());
                    i += 1;
                }
                Ok(Self::Profile {
                    identity: identity.clone(),
                    username,
                    avatar,
                })
            }
            "dedupe" => {
                if args.len() != 1 {
                    return Err(usage("usage: sbauth dedupe"));
                }
                Ok(Self::Dedupe)
            }
            "theme" => match args.len() {
                1 => Ok(Self::Theme(None)),
                2 => Ok(Self::Theme(Some(args[1].clone()))),
                _ => Err(usage("usage: sbauth theme [<name>]")),
            },
            _ => Err(usage(&format!("unknown command: {}", first))),
        }
    }
}

struct SbAuthApp {
    config: Config,
    accounts: AccountStore,
    instance_cache: InstanceCache,
    themes: ThemeStore,
    resolver: InstanceResolver,
    post_json: PostJsonClient,
    secret_reader: SecretReader,
    event_log: Arc<EventLog>,
}

impl SbAuthApp {
    fn new(config: Config) -> AuthResult<Self> {
        let clients = HttpClients::with_timeout(config.http_timeout)?;
        let directory = match config.instances_feed.as_deref() {
            Some(source) => match load_instance_feed(source, &clients.get_json) {
                Ok(entries) => InstanceDirectory::from_feed(entries),
                Err(err) => {
                    tracing::warn!(source, error = %err, "instance feed unavailable");
                    InstanceDirectory::default()
                }
            },
            None => InstanceDirectory::default(),
        };
        let store: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(config.store_dir()));

        Ok(Self::with_clients(
            config,
            store,
            clients,
            directory,
            Arc::new(default_secret_reader),
        ))
    }

    fn with_clients(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        clients: HttpClients,
        directory: InstanceDirectory,
        secret_reader: SecretReader,
    ) -> Self {
        let event_log = Arc::new(EventLog::new(config.log_dir()));
        let resolver = InstanceResolver::new(
            Arc::new(directory),
            config.protocol.clone(),
            clients.get_json,
            clients.probe,
        );

        Self {
            accounts: AccountStore::new(store.clone(), event_log.clone()),
            instance_cache: InstanceCache::new(store.clone()),
            themes: ThemeStore::new(store),
            resolver,
            post_json: clients.post_json,
            secret_reader,
            event_log,
            config,
        }
    }

    fn print_usage(&self) {
        println!("{}", USAGE);
    }

    /// Defaulting and deduplication run before every command.
    fn startup(&self) -> AuthResult<()> {
        let report = self.accounts.dedupe()?;
        if !report.is_empty() {
            tracing::info!(
                removed = report.removed.len(),
                renamed = report.renamed.len(),
                "account directory deduplicated"
            );
        }
        Ok(())
    }

    fn list_accounts(&self) -> AuthResult<()> {
        for line in self.account_lines()? {
            println!("{}", line);
        }
        Ok(())
    }

    fn account_lines(&self) -> AuthResult<Vec<String>> {
        let directory = self.accounts.load()?;
        let accounts = self.accounts.normalized_accounts()?;
        // A pointer at a record that no longer exists counts as no current account.
        let current = directory.current().and(directory.current_account_key.clone());

        let mut lines = Vec::new();
        lines.push(format!(
            "Current: {}",
            current.as_deref().unwrap_or("(none)")
        ));
        lines.push("Accounts:".to_string());
        if accounts.is_empty() {
            lines.push("  (none)".to_string());
        }
        for (identity, record) in &accounts {
            let marker = if current.as_deref() == Some(identity.as_str()) {
                " [current]"
            } else {
                ""
            };
            lines.push(format!("  {}{}", identity, marker));
            lines.push(format!(
                "    username: {}",
                record.username.as_deref().unwrap_or("-")
            ));
            lines.push(format!("    instance: {}", record.server_urls.wellknown));
            lines.push(format!("    api: {}", record.server_urls.api));
            if let Some(avatar) = record.profile_image_ref.as_deref() {
                lines.push(format!("    avatar: {}", avatar));
            }
        }
        Ok(lines)
    }

    fn check(&self, input: Option<&str>) -> AuthResult<()> {
        match input {
            Some(input) => {
                if self.report_check(input) {
                    Ok(())
                } else {
                    Err(AuthError::NotFound(input.to_string()))
                }
            }
            None => {
                let (sender, receiver) = mpsc::channel();
                std::thread::spawn(move || {
                    let stdin = std::io::stdin();
                    for line in stdin.lock().lines() {
                        let Ok(line) = line else { break };
                        if sender.send(line).is_err() {
                            break;
                        }
                    }
                });
                self.watch_instance_input(receiver)
            }
        }
    }

    /// The value the instance prompt starts from.
    fn initial_instance(&self) -> AuthResult<String> {
        if let Some(cached) = self.instance_cache.load()? {
            return Ok(cached.input_value().to_string());
        }
        Ok(self
            .resolver
            .directory()
            .default_instance()
            .unwrap_or(self.config.default_instance.as_str())
            .to_string())
    }

    /// Each received line replaces the typed instance; a check runs once input
    /// has been idle for the debounce window, and once more when input ends.
    fn watch_instance_input(&self, lines: Receiver<String>) -> AuthResult<()> {
        let initial = self.initial_instance()?;
        println!("Instance: {}", initial);
        let mut debouncer = Debouncer::new(self.config.debounce);
        let mut typed = false;

        loop {
            let wait = debouncer
                .remaining(Instant::now())
                .unwrap_or(Duration::from_secs(3600));
            match lines.recv_timeout(wait) {
                Ok(line) => {
                    let input = line.trim().to_string();
                    if input.is_empty() {
                        continue;
                    }
                    typed = true;
                    println!("{}", CheckStatus::Waiting.message());
                    debouncer.schedule(input, Instant::now());
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(input) = debouncer.poll(Instant::now()) {
                        self.report_check(&input);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if let Some(input) = debouncer.flush() {
                        self.report_check(&input);
                    } else if !typed {
                        self.report_check(&initial);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn report_check(&self, input: &str) -> bool {
        println!("{}", CheckStatus::Checking.message());
        match check_instance(&self.resolver, &self.instance_cache, input) {
            Ok(info) => {
                self.event_log.record(&AuditEvent::InstanceChecked {
                    input: input.to_string(),
                    wellknown: info.wellknown.clone(),
                    api: info.api.clone(),
                });
                println!("{}", CheckStatus::Valid.message());
                println!("  api: {}", info.api);
                println!("  cdn: {}", info.cdn);
                println!("  gateway: {}", info.gateway);
                println!("  login: {}", info.login);
                true
            }
            Err(err) => {
                tracing::warn!(input, error = %err, "instance check failed");
                println!("{}", CheckStatus::Invalid.message());
                false
            }
        }
    }

    fn list_instances(&self) -> AuthResult<()> {
        let listings = self.resolver.directory().listings();
        if listings.is_empty() {
            println!("(no instance feed configured; set SBAUTH_INSTANCES)");
        }
        for listing in listings {
            let disabled = if listing.enabled { "" } else { " (disabled)" };
            if listing.label == listing.name {
                println!("{}{}", listing.name, disabled);
            } else {
                println!("{} - {}{}", listing.name, listing.label, disabled);
            }
        }
        Ok(())
    }

    fn login(
        &self,
        login: &str,
        instance: Option<&str>,
        captcha: Option<&str>,
        page: Option<&str>,
    ) -> AuthResult<String> {
        let page = page.map(LoginPage::from_url).transpose()?.unwrap_or_default();
        let info = match instance.or(page.instance.as_deref()) {
            Some(input) => check_instance(&self.resolver, &self.instance_cache, input)?,
            None => self.instance_cache.load()?.ok_or_else(|| {
                AuthError::Usage(
                    "no instance checked yet; run `sbauth check <instance>` or pass --instance"
                        .to_string(),
                )
            })?,
        };

        let password = (self.secret_reader)("SBAUTH_PASSWORD", "Password: ")?;
        let credentials = Credentials {
            login: login.to_string(),
            password,
            captcha_key: captcha.map(str::to_string),
        };
        let mut flow = LoginFlow::new(info, &self.accounts, self.post_json.clone(), page);
        flow.submit(&credentials)?;
        let mut state = flow.state().clone();

        loop {
            match state {
                LoginState::MfaRequired { prompt, .. } => {
                    let code = (self.secret_reader)("SBAUTH_MFA_CODE", &prompt.title)?;
                    flow.submit_mfa(&code)?;
                    state = flow.state().clone();
                }
                LoginState::ChallengeRequired { site_key, widget } => {
                    let hint = match widget {
                        ChallengeWidget::Render => "solve the captcha",
                        ChallengeWidget::Reset => "solve a fresh captcha",
                    };
                    return Err(AuthError::Validation(format!(
                        "captcha required (site key {}); {} and retry with --captcha <token>",
                        site_key, hint
                    )));
                }
                LoginState::Failed { message } => return Err(AuthError::Validation(message)),
                LoginState::Success {
                    identity,
                    navigate_to,
                } => {
                    println!("logged in: {}", identity);
                    println!("continue at: {}", navigate_to);
                    return Ok(navigate_to);
                }
                LoginState::Ignored | LoginState::Idle | LoginState::Submitting => {
                    return Ok(String::new())
                }
            }
        }
    }

    fn switch_account(&self, identity: &str) -> AuthResult<()> {
        self.accounts.set_current(identity)?;
        println!("switched to {}", identity);
        Ok(())
    }

    fn edit_profile(
        &self,
        identity: &str,
        username: Option<&str>,
        avatar: Option<&str>,
    ) -> AuthResult<()> {
        let record = self.accounts.update(identity, |record| {
            if let Some(username) = username {
                record.username = Some(username.to_string());
            }
            if let Some(avatar) = avatar {
                record.profile_image_ref = Some(avatar.to_string());
            }
        })?;
        println!("{}", identity);
        println!("  username: {}", record.username.as_deref().unwrap_or("-"));
        println!(
            "  avatar: {}",
            record.profile_image_ref.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    fn dedupe_accounts(&self) -> AuthResult<()> {
        let report = self.accounts.dedupe()?;
        if report.is_empty() {
            println!("no duplicate accounts");
        }
        for identity in &report.removed {
            println!("removed {}", identity);
        }
        for (from, to) in &report.renamed {
            println!("renamed {} -> {}", from, to);
        }
        Ok(())
    }

    fn theme(&self, name: Option<&str>) -> AuthResult<()> {
        match name {
            Some(name) => {
                self.themes.set(name)?;
                println!("{}", name);
            }
            None => println!("{}", self.themes.load()?),
        }
        Ok(())
    }
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("sbauth: {}", err);
        std::process::exit(err.exit_code());
    }
}

fn run() -> AuthResult<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = CliCommand::parse(&args)?;
    let app = SbAuthApp::new(Config::from_env())?;
    if command != CliCommand::Help {
        app.startup()?;
    }

    match command {
        CliCommand::Help => {
            app.print_usage();
            Ok(())
        }
        CliCommand::List => app.list_accounts(),
        CliCommand::Check(input) => app.check(input.as_deref()),
        CliCommand::Instances => app.list_instances(),
        CliCommand::Login {
            login,
            instance,
            captcha,
            page,
        } => app
            .login(
                &login,
                instance.as_deref(),
                captcha.as_deref(),
                page.as_deref(),
            )
            .map(|_| ()),
        CliCommand::Switch(identity) => app.switch_account(&identity),
        CliCommand::Profile {
            identity,
            username,
            avatar,
        } => app.edit_profile(&identity, username.as_deref(), avatar.as_deref()),
        CliCommand::Dedupe => app.dedupe_accounts(),
        CliCommand::Theme(name) => app.theme(name.as_deref()),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SBAUTH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn default_secret_reader(env_name: &str, prompt: &str) -> AuthResult<String> {
    if let Some(value) = std::env::var(env_name)
        .ok()
        .filter(|value| !value.is_empty())
    {
        return Ok(value);
    }

    eprint!("{} ", prompt.trim_end());
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| AuthError::Usage(format!("failed to read {}: {}", env_name, err)))?;
    let value = line.trim_end_matches(['\r', '\n']).to_string();
    if value.is_empty() {
        return Err(AuthError::Usage(format!(
            "{} is required (set {} or type it on stdin)",
            prompt.trim_end_matches([':', ' ']),
            env_name
        )));
    }
    Ok(value)
}
