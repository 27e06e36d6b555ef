use serde_json::{json, Map, Value};
use url::Url;

use crate::accounts::{AccountRecord, AccountStore};
use crate::config::DEFAULT_LANDING;
use crate::error::{AuthError, AuthResult};
use crate::http::PostJsonClient;
use crate::instance::InstanceInfo;
use crate::urls::join_path;

const LOGIN_PATH: &str = "auth/login";
const MFA_PATH: &str = "auth/mfa/totp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResponse {
    Rejected { message: String },
    Challenge { site_key: String },
    Mfa { ticket: String },
    Token { token: String },
    Empty,
}

impl LoginResponse {
    pub fn decode(body: &Value) -> Self {
        if let Some(message) = body.get("errors").and_then(first_field_error) {
            return Self::Rejected { message };
        }
        if let Some(site_key) = non_empty_str(body, "captcha_sitekey") {
            return Self::Challenge { site_key };
        }
        if let Some(ticket) = non_empty_str(body, "ticket") {
            return Self::Mfa { ticket };
        }
        if let Some(token) = non_empty_str(body, "token") {
            return Self::Token { token };
        }
        if let Some(message) = non_empty_str(body, "message") {
            return Self::Rejected { message };
        }
        Self::Empty
    }
}

fn non_empty_str(body: &Value, field: &str) -> Option<String> {
    body.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// `errors.<field>._errors[0].message`, looking at `login` first.
fn first_field_error(errors: &Value) -> Option<String> {
    let fields = errors.as_object()?;
    let field_message = |value: &Value| {
        value
            .get("_errors")?
            .get(0)?
            .get("message")?
            .as_str()
            .map(str::to_string)
    };
    ["login", "password"]
        .iter()
        .filter_map(|name| fields.get(*name))
        .chain(fields.values())
        .find_map(field_message)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
    pub captcha_key: Option<String>,
}

impl Credentials {
    fn request_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("login".to_string(), Value::String(self.login.clone()));
        body.insert("password".to_string(), Value::String(self.password.clone()));
        body.insert("undelete".to_string(), Value::Bool(false));
        if let Some(captcha) = self.captcha_key.as_deref().filter(|key| !key.is_empty()) {
            body.insert("captcha_key".to_string(), Value::String(captcha.to_string()));
        }
        Value::Object(body)
    }
}

/// What the UI should do with the challenge widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeWidget {
    Render,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptField {
    pub name: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAction {
    SubmitMfaCode,
}

/// Description of a dialog; rendering is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub title: String,
    pub fields: Vec<PromptField>,
    pub submit_label: String,
    pub action: PromptAction,
}

impl Prompt {
    pub fn mfa_code() -> Self {
        Self {
            title: "2FA code:".to_string(),
            fields: vec![PromptField {
                name: "code".to_string(),
                label: String::new(),
            }],
            submit_label: "Submit".to_string(),
            action: PromptAction::SubmitMfaCode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    Submitting,
    ChallengeRequired {
        site_key: String,
        widget: ChallengeWidget,
    },
    MfaRequired {
        ticket: String,
        prompt: Prompt,
    },
    Failed {
        message: String,
    },
    Success {
        identity: String,
        navigate_to: String,
    },
    /// The server answered with nothing usable; not shown to the user.
    Ignored,
}

/// Query parameters the login page understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginPage {
    pub instance: Option<String>,
    pub goback: Option<String>,
}

impl LoginPage {
    /// Accepts an absolute page URL or a relative one such as `/login?goback=/x`.
    pub fn from_url(raw: &str) -> AuthResult<Self> {
        let page = Url::parse("http://localhost/")
            .and_then(|base| base.join(raw))
            .map_err(|err| AuthError::invalid_url(raw, err))?;
        let mut parsed = Self::default();
        for (name, value) in page.query_pairs() {
            if value.is_empty() {
                continue;
            }
            match &*name {
                "instance" => parsed.instance = Some(value.into_owned()),
                "goback" => parsed.goback = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(parsed)
    }

    pub fn navigation_target(&self) -> String {
        self.goback
            .clone()
            .unwrap_or_else(|| DEFAULT_LANDING.to_string())
    }
}

pub struct LoginFlow<'a> {
    instance: InstanceInfo,
    accounts: &'a AccountStore,
    post_json: PostJsonClient,
    page: LoginPage,
    state: LoginState,
    login: Option<String>,
    challenge_shown: bool,
}

impl<'a> LoginFlow<'a> {
    pub fn new(
        instance: InstanceInfo,
        accounts: &'a AccountStore,
        post_json: PostJsonClient,
        page: LoginPage,
    ) -> Self {
        Self {
            instance,
            accounts,
            post_json,
            page,
            state: LoginState::Idle,
            login: None,
            challenge_shown: false,
        }
    }

    pub fn state(&self) -> &LoginState {
        &self.state
    }

    pub fn submit(&mut self, credentials: &Credentials) -> AuthResult<&LoginState> {
        self.state = LoginState::Submitting;
        self.login = Some(credentials.login.clone());
        let url = join_path(&self.instance.login, LOGIN_PATH);
        tracing::debug!(url = %url, login = %credentials.login, "submitting credentials");

        let body = self.post(&url, &credentials.request_body())?;
        self.apply(LoginResponse::decode(&body))?;
        Ok(&self.state)
    }

    pub fn submit_mfa(&mut self, code: &str) -> AuthResult<&LoginState> {
        let LoginState::MfaRequired { ticket, .. } = &self.state else {
            return Err(AuthError::Usage("no MFA challenge is pending".to_string()));
        };
        let body = json!({ "code": code.trim(), "ticket": ticket });
        let url = join_path(&self.instance.login, MFA_PATH);

        let response = LoginResponse::decode(&self.post(&url, &body)?);
        match response {
            LoginResponse::Token { .. } | LoginResponse::Rejected { .. } | LoginResponse::Empty => {
                self.apply(response)?
            }
            LoginResponse::Challenge { .. } | LoginResponse::Mfa { .. } => {
                tracing::warn!(?response, "unexpected MFA response");
                self.state = LoginState::Ignored;
            }
        }
        Ok(&self.state)
    }

    fn post(&mut self, url: &str, body: &Value) -> AuthResult<Value> {
        match (self.post_json)(url, body) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.state = LoginState::Failed {
                    message: err.to_string(),
                };
                Err(err)
            }
        }
    }

    fn apply(&mut self, response: LoginResponse) -> AuthResult<()> {
        self.state = match response {
            LoginResponse::Rejected { message } => LoginState::Failed { message },
            LoginResponse::Challenge { site_key } => {
                let widget = if self.challenge_shown {
                    ChallengeWidget::Reset
                } else {
                    ChallengeWidget::Render
                };
                self.challenge_shown = true;
                LoginState::ChallengeRequired { site_key, widget }
            }
            LoginResponse::Mfa { ticket } => LoginState::MfaRequired {
                ticket,
                prompt: Prompt::mfa_code(),
            },
            LoginResponse::Token { token } => {
                let identity = self.persist_account(&token)?;
                LoginState::Success {
                    identity,
                    navigate_to: self.page.navigation_target(),
                }
            }
            LoginResponse::Empty => {
                tracing::warn!(
                    instance = %self.instance.wellknown,
                    "login response carried nothing usable"
                );
                LoginState::Ignored
            }
        };
        Ok(())
    }

    fn persist_account(&self, token: &str) -> AuthResult<String> {
        let login = self.login.clone().unwrap_or_default();
        let mut record = AccountRecord::new(&self.instance.server_urls(), &login, token)
            .inspect_err(|err| {
                tracing::error!(
                    error = %err,
                    instance = %self.instance.wellknown,
                    "cannot build account from login response"
                );
            })?;
        record.username = Some(login);
        self.accounts.add_or_update(record, true)
    }
}
