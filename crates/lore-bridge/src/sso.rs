//! Two-phase single sign-on: send the user to the homeserver's SSO redirect,
//! then turn the authorized redirect into a local callback carrying the
//! login token.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use lore_core::errors::BridgeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginType {
    Sso,
    Cas,
}

impl LoginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sso => "sso",
            Self::Cas => "cas",
        }
    }
}

/// Whatever shows the user the login page and reports where the homeserver
/// sent them afterwards.
#[async_trait]
pub trait AuthFlow: Send + Sync {
    async fn launch(&self, login_url: &Url, redirect_url: &Url) -> Result<Url, BridgeError>;
}

#[derive(Clone, Debug)]
pub struct SsoLogin {
    homeserver: Url,
    redirect_url: Url,
    callback_base: Url,
}

impl SsoLogin {
    pub fn new(homeserver: Url, redirect_url: Url, callback_base: Url) -> Self {
        Self {
            homeserver,
            redirect_url,
            callback_base,
        }
    }

    pub fn login_url(&self, login_type: LoginType) -> Result<Url, BridgeError> {
        let base = self.homeserver.as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!(
            "{base}/_matrix/client/v3/login/{}/redirect",
            login_type.as_str()
        ))
        .map_err(|e| BridgeError::Codec(format!("homeserver url: {e}")))?;
        let _ = url
            .query_pairs_mut()
            .append_pair("redirectUrl", self.redirect_url.as_str());
        Ok(url)
    }

    /// Phase one. Resolves to the URL the homeserver redirected to.
    pub async fn authorize(
        &self,
        flow: &dyn AuthFlow,
        login_type: LoginType,
        cancel: &CancellationToken,
    ) -> Result<Url, BridgeError> {
        let login_url = self.login_url(login_type)?;
        info!(homeserver = %self.homeserver, login_type = login_type.as_str(), "starting single sign-on");
        tokio::select! {
            () = cancel.cancelled() => {
                warn!("single sign-on cancelled by user");
                Err(BridgeError::PermissionDenied("single sign-on cancelled".into()))
            }
            outcome = flow.launch(&login_url, &self.redirect_url) => outcome.map_err(|e| {
                warn!(error = %e, "single sign-on failed");
                e
            }),
        }
    }

    /// Phase two. The returned URL carries the login token in its query.
    pub fn complete(&self, authorized: &Url, fragment_after_login: &str) -> Result<Url, BridgeError> {
        let Some(token) = authorized
            .query_pairs()
            .find(|(k, _)| k == "loginToken")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
        else {
            warn!("single sign-on redirect carried no login token");
            return Err(BridgeError::PermissionDenied("missing loginToken".into()));
        };

        let mut callback = self.callback_base.clone();
        let fragment = fragment_after_login.trim_start_matches('#');
        callback.set_fragment((!fragment.is_empty()).then_some(fragment));
        let _ = callback.query_pairs_mut().append_pair("loginToken", &token);
        Ok(callback)
    }

    pub async fn start(
        &self,
        flow: &dyn AuthFlow,
        login_type: LoginType,
        fragment_after_login: &str,
        cancel: &CancellationToken,
    ) -> Result<Url, BridgeError> {
        let authorized = self.authorize(flow, login_type, cancel).await?;
        self.complete(&authorized, fragment_after_login)
    }
}

#[cfg(test)]
mod tests {
    use std::future::pending;

    use super::*;

    struct Redirects(Url);

    #[async_trait]
    impl AuthFlow for Redirects {
        async fn launch(&self, login_url: &Url, redirect_url: &Url) -> Result<Url, BridgeError> {
            assert!(login_url.as_str().contains("/_matrix/client/v3/login/"));
            assert!(self.0.as_str().starts_with(redirect_url.as_str()));
            Ok(self.0.clone())
        }
    }

    struct NeverReturns;

    #[async_trait]
    impl AuthFlow for NeverReturns {
        async fn launch(&self, _: &Url, _: &Url) -> Result<Url, BridgeError> {
            pending().await
        }
    }

    fn login() -> SsoLogin {
        SsoLogin::new(
            Url::parse("https://matrix.example.org/").unwrap(),
            Url::parse("https://ext.example/redirect").unwrap(),
            Url::parse("https://app.example/index.html").unwrap(),
        )
    }

    #[test]
    fn login_url_per_type() {
        let sso = login().login_url(LoginType::Sso).unwrap();
        assert_eq!(sso.path(), "/_matrix/client/v3/login/sso/redirect");
        let redirect: Vec<_> = sso.query_pairs().collect();
        assert_eq!(redirect[0].0, "redirectUrl");
        assert_eq!(redirect[0].1, "https://ext.example/redirect");

        let cas = login().login_url(LoginType::Cas).unwrap();
        assert_eq!(cas.path(), "/_matrix/client/v3/login/cas/redirect");
    }

    #[tokio::test]
    async fn full_flow_sets_token_and_fragment() {
        let flow = Redirects(Url::parse("https://ext.example/redirect?loginToken=abc123").unwrap());
        let url = login()
            .start(&flow, LoginType::Sso, "#/home", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(url.fragment(), Some("/home"));
        assert_eq!(url.query(), Some("loginToken=abc123"));
        assert_eq!(url.path(), "/index.html");
    }

    #[tokio::test]
    async fn missing_token_is_denied() {
        let flow = Redirects(Url::parse("https://ext.example/redirect?error=nope").unwrap());
        let err = login()
            .start(&flow, LoginType::Sso, "", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn cancellation_aborts_authorize() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = login()
            .authorize(&NeverReturns, LoginType::Cas, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::PermissionDenied(_)));
    }
}
