use serde::{Deserialize, Serialize};
use url::{Position, Url};

use crate::error::{AuthError, AuthResult};

/// API version every stored `api` URL is pinned to.
pub const API_VERSION: &str = "v9";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    Api,
    Cdn,
    Gateway,
    Login,
    WellKnown,
}

/// The endpoint set stored with every account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerUrls {
    pub api: String,
    pub cdn: String,
    pub gateway: String,
    pub wellknown: String,
    pub login: String,
}

impl ServerUrls {
    pub fn normalized(&self) -> AuthResult<Self> {
        Ok(Self {
            api: normalize(&self.api, UrlKind::Api)?,
            cdn: normalize(&self.cdn, UrlKind::Cdn)?,
            gateway: normalize(&self.gateway, UrlKind::Gateway)?,
            wellknown: normalize(&self.wellknown, UrlKind::WellKnown)?,
            login: normalize(&self.login, UrlKind::Login)?,
        })
    }
}

/// Canonicalizes an endpoint so two spellings of the same server compare equal.
///
/// `WellKnown` is the only kind that keeps a trailing slash: the slash-terminated
/// form is what lookups and account deduplication key on.
pub fn normalize(raw: &str, kind: UrlKind) -> AuthResult<String> {
    let parsed = Url::parse(raw.trim()).map_err(|err| AuthError::invalid_url(raw, err))?;
    if parsed.cannot_be_a_base() {
        return Err(AuthError::invalid_url(raw, "not a hierarchical URL"));
    }

    let normalized = match kind {
        UrlKind::Api => format!(
            "{}{}/{}",
            &parsed[..Position::BeforePath],
            strip_version_suffix(parsed.path()),
            API_VERSION
        ),
        UrlKind::WellKnown => ensure_trailing_slash(parsed.as_str()),
        UrlKind::Cdn | UrlKind::Gateway | UrlKind::Login => {
            strip_trailing_slash(parsed.as_str()).to_string()
        }
    };
    Ok(normalized)
}

/// Removes `/`, `/v<digits>` or `/v<digits>/` from the end of a URL path.
fn strip_version_suffix(path: &str) -> &str {
    let body = path.strip_suffix('/').unwrap_or(path);
    let Some(index) = body.rfind('/') else {
        return body;
    };
    let segment = &body[index + 1..];
    let is_version = segment.len() > 1
        && segment.starts_with('v')
        && segment[1..].bytes().all(|byte| byte.is_ascii_digit());
    if is_version {
        &body[..index]
    } else {
        body
    }
}

pub fn ensure_trailing_slash(raw: &str) -> String {
    if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    }
}

pub fn strip_trailing_slash(raw: &str) -> &str {
    raw.strip_suffix('/').unwrap_or(raw)
}

pub fn is_absolute_url(raw: &str) -> bool {
    Url::parse(raw).is_ok()
}

/// Account map key: email followed by the well-known URL without its trailing slash.
pub fn identity_key(email: &str, well_known: &str) -> String {
    format!("{}{}", email, strip_trailing_slash(well_known))
}

/// `<base>/<path>` without doubling or dropping the separator.
pub fn join_path(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        strip_trailing_slash(base),
        path.trim_start_matches('/')
    )
}
