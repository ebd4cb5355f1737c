use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use percent_encoding::percent_decode_str;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, LOCATION, USER_AGENT};
use tracing::{debug, instrument};
use url::Url;

use super::AuthClient;
use crate::config::{RP_MINECRAFT, SISU_QUERY};
use crate::errors::{MsAuthError, Result};
use crate::record::XstsToken;

/// The SISU endpoint only redirects browsers
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:146.0) Gecko/20100101 Firefox/146.0";

const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

impl AuthClient {
    /// Replay the minecraft.net web login with browser cookies and pull the
    /// Minecraft XSTS token out of the final redirect.
    ///
    /// `cookies` is a `Cookie` header value, see [`crate::cookie::reformat_cookies`].
    #[instrument(skip_all)]
    pub async fn xsts_from_cookies(&self, cookies: &str) -> Result<XstsToken> {
        let mut start = Url::parse(&self.config.endpoints.sisu_connect)?;
        start.query_pairs_mut().extend_pairs(SISU_QUERY);

        let second = self.follow_redirect(start.as_str(), None).await?;
        let third = self.follow_redirect(&second, Some(cookies)).await?;
        let last = self.follow_redirect(&third, Some(cookies)).await?;

        parse_access_token(&last)
    }

    /// Request `url` and return the `Location` of its 302, spaces encoded
    async fn follow_redirect(&self, url: &str, cookies: Option<&str>) -> Result<String> {
        let mut request = self
            .http
            .get(url)
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(ACCEPT_LANGUAGE, "en-GB,en;q=0.5")
            .header(USER_AGENT, BROWSER_USER_AGENT);
        if let Some(cookies) = cookies {
            request = request.header(COOKIE, cookies.trim_end_matches([';', ' ']));
        }

        let response = self.send(request).await?;
        let status = response.status();
        if status != StatusCode::FOUND {
            return Err(MsAuthError::CookieLogin(format!(
                "Expected a redirect, got HTTP {status}; the cookies may be expired"
            )));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| MsAuthError::CookieLogin("Redirect without a Location header".to_string()))?;

        // Relative locations resolve against the request URL
        let next = match Url::parse(location) {
            Ok(_) => location.to_string(),
            Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(url)?.join(location)?.to_string(),
            Err(e) => return Err(e.into()),
        };

        debug!("Followed SISU redirect");
        Ok(next.replace(' ', "%20"))
    }
}

/// Extract the Minecraft XSTS token from the `accessToken` parameter of the
/// final redirect. The payload is base64 of loosely JSON-shaped text with
/// one entry per relying party.
fn parse_access_token(location: &str) -> Result<XstsToken> {
    let encoded = location
        .split_once("accessToken=")
        .map(|(_, rest)| rest.split('&').next().unwrap_or(rest))
        .ok_or_else(|| MsAuthError::CookieLogin("Final redirect has no accessToken".to_string()))?;

    let decoded = BASE64
        .decode(unescape(encoded))
        .map_err(|e| MsAuthError::CookieLogin(format!("accessToken is not base64: {e}")))?;
    let decoded = String::from_utf8_lossy(&decoded);

    let marker = format!("\"{RP_MINECRAFT}\",");
    let (_, minecraft) = decoded.split_once(&marker).ok_or_else(|| {
        MsAuthError::CookieLogin("accessToken has no Minecraft Services entry".to_string())
    })?;

    let uhs = quoted_after(minecraft, r#"{"DisplayClaims":{"xui":[{"uhs":""#)
        .ok_or_else(|| MsAuthError::CookieLogin("Missing user hash".to_string()))?;
    let token = quoted_after(minecraft, r#""Token":""#)
        .ok_or_else(|| MsAuthError::CookieLogin("Missing XSTS token".to_string()))?;

    Ok(XstsToken {
        token: token.to_string(),
        uhs: uhs.to_string(),
        not_after: None,
    })
}

/// Text between `prefix` and the next double quote
fn quoted_after<'a>(haystack: &'a str, prefix: &str) -> Option<&'a str> {
    let (_, rest) = haystack.split_once(prefix)?;
    rest.split('"').next()
}

/// Percent-decode; `+` stays a base64 digit rather than becoming a space
fn unescape(value: &str) -> Vec<u8> {
    percent_decode_str(value).collect()
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::client::test_support::{access_token_payload, mount_sisu, test_config};

    #[test]
    fn test_parse_access_token() {
        let location = format!(
            "https://www.minecraft.net/en-us/login#state=login&accessToken={}",
            access_token_payload()
        );
        let xsts = parse_access_token(&location).unwrap();

        assert_eq!(xsts.uhs, "uhs-1");
        assert_eq!(xsts.token, "xsts-token");
        assert_eq!(xsts.identity_token(), "XBL3.0 x=uhs-1;xsts-token");
    }

    #[test]
    fn test_parse_access_token_failures() {
        assert!(matches!(
            parse_access_token("https://www.minecraft.net/en-us/login"),
            Err(MsAuthError::CookieLogin(_))
        ));

        let no_minecraft = STANDARD.encode(r#"[{"Item1":"http://xboxlive.com","Item2":{"Token":"t"}}]"#);
        assert!(matches!(
            parse_access_token(&format!("x?accessToken={no_minecraft}")),
            Err(MsAuthError::CookieLogin(_))
        ));
    }

    #[test]
    fn test_unescape_padding() {
        let escaped = STANDARD.encode("ab").replace('=', "%3D");
        assert_eq!(BASE64.decode(unescape(&escaped)).unwrap(), b"ab");
    }

    #[test]
    fn test_unescape_any_byte() {
        assert_eq!(unescape("a%2Bb%2fc%3d%3D"), b"a+b/c==");
        assert_eq!(unescape("%7B%22x%22%3A1%7D"), b"{\"x\":1}");
        // Literal plus signs are base64 digits
        assert_eq!(unescape("ab+c"), b"ab+c");
    }

    #[tokio::test]
    async fn test_xsts_from_cookies() {
        let server = MockServer::start().await;
        mount_sisu(&server, "a=1; b=2").await;

        let client = AuthClient::new(test_config(&server)).unwrap();
        let xsts = client.xsts_from_cookies("a=1; b=2; ").await.unwrap();
        assert_eq!(xsts.identity_token(), "XBL3.0 x=uhs-1;xsts-token");
    }

    #[tokio::test]
    async fn test_expired_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/connect/XboxLive/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>sign in</html>"))
            .mount(&server)
            .await;

        let client = AuthClient::new(test_config(&server)).unwrap();
        let result = client.xsts_from_cookies("a=1").await;
        assert!(matches!(result, Err(MsAuthError::CookieLogin(_))));
    }
}
