use std::env;

use bon::Builder;
use url::Url;

use crate::Result;
use crate::error::Error;

/// Environment variable holding the API server host.
pub const SERVER_URL_VAR: &str = "DERIV_SERVER_URL";
/// Environment variable holding the registered application id.
pub const APP_ID_VAR: &str = "DERIV_APP_ID";
/// Environment variable holding the response language tag.
pub const LANGUAGE_VAR: &str = "DERIV_LANGUAGE";

pub const DEFAULT_HOST: &str = "ws.derivws.com";
pub const DEFAULT_LANGUAGE: &str = "EN";

const BRAND: &str = "deriv";

/// Where the client connects.
///
/// The URL shape is fixed by the backend:
/// `wss://<host>/websockets/v3?app_id=<id>&l=<lang>&brand=deriv`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(on(String, into))]
pub struct Endpoint {
    #[builder(default = DEFAULT_HOST.to_owned())]
    pub host: String,
    pub app_id: u32,
    #[builder(default = DEFAULT_LANGUAGE.to_owned())]
    pub language: String,
}

impl Endpoint {
    /// Read the endpoint from [`SERVER_URL_VAR`], [`APP_ID_VAR`] and
    /// [`LANGUAGE_VAR`]. Only the application id is required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let app_id = lookup(APP_ID_VAR)
            .ok_or_else(|| Error::validation(format!("{APP_ID_VAR} is not set")))?;
        let app_id = app_id.trim().parse::<u32>().map_err(|e| {
            Error::validation(format!("{APP_ID_VAR} must be a number, got {app_id:?}: {e}"))
        })?;

        Ok(Self {
            host: lookup(SERVER_URL_VAR).unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            app_id,
            language: lookup(LANGUAGE_VAR).unwrap_or_else(|| DEFAULT_LANGUAGE.to_owned()),
        })
    }

    /// The WebSocket URL for this endpoint.
    pub fn url(&self) -> Result<String> {
        let url = format!(
            "wss://{}/websockets/v3?app_id={}&l={}&brand={BRAND}",
            self.host, self.app_id, self.language
        );
        Url::parse(&url)?;
        Ok(url)
    }
}
