use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Version};
use tokio::time::Instant;
use url::Url;

use crate::error::{Error, ProbeError, Result};
use crate::lifecycle;
use crate::outcome::{ProbeOutcome, ProbePayload};
use crate::probe::Prober;

const DEFAULT_PORT: u16 = 80;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REDIRECT_LIMIT: usize = 5;
const DEFAULT_USER_AGENT: &str = "async-probe";

/// Probes a host with an HTTP request.
///
/// The target may be a full URL or a bare host; the scheme defaults to
/// `http` and the path to `/`. A HEAD request is issued (GET with
/// [`with_get`](HttpProbeBuilder::with_get)) and a 2xx response is success.
/// Redirects are followed up to `redirect_limit`; a probe that only
/// succeeds after redirects keeps the first redirect's status reason as a
/// warning. Certificate verification is off by default, since liveness
/// checks routinely face self-signed certificates.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    host: Option<String>,
    port: Option<u16>,
    timeout: Option<Duration>,
    follow_redirect: bool,
    redirect_limit: usize,
    user_agent: String,
    verify_tls: bool,
    use_get: bool,
    proxy: Option<Url>,
}

#[derive(Clone, Debug, Default)]
pub struct HttpProbeBuilder {
    host: Option<String>,
    port: Option<u16>,
    timeout: Option<Duration>,
    follow_redirect: Option<bool>,
    redirect_limit: Option<usize>,
    user_agent: Option<String>,
    verify_tls: Option<bool>,
    use_get: Option<bool>,
    proxy: Option<String>,
}

impl HttpProbeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The target: a full URL, a scheme-relative `//host/path`, or a bare
    /// host name.
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// Overrides the port found in (or implied by) the target URL.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether a redirect is followed (the default) or fails the probe.
    pub fn with_follow_redirect(mut self, follow_redirect: bool) -> Self {
        self.follow_redirect = Some(follow_redirect);
        self
    }

    pub fn with_redirect_limit(mut self, redirect_limit: usize) -> Self {
        self.redirect_limit = Some(redirect_limit);
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_string());
        self
    }

    /// Turn certificate verification back on for https targets.
    pub fn with_tls_verification(mut self, verify_tls: bool) -> Self {
        self.verify_tls = Some(verify_tls);
        self
    }

    /// Issue GET instead of HEAD and record the body as the response.
    pub fn with_get(mut self, use_get: bool) -> Self {
        self.use_get = Some(use_get);
        self
    }

    /// Route the probe through an explicit proxy instead of consulting the
    /// `http_proxy`/`https_proxy`/`no_proxy` environment.
    pub fn with_proxy(mut self, proxy: &str) -> Self {
        self.proxy = Some(proxy.to_string());
        self
    }

    pub fn build(self) -> Result<HttpProbe> {
        let proxy = match &self.proxy {
            None => None,
            Some(proxy) => Some(Url::parse(proxy).map_err(|err| Error::InvalidUrl {
                url: proxy.clone(),
                reason: err.to_string(),
            })?),
        };
        // A port carried by the target URL becomes the instance default,
        // unless one was configured explicitly.
        let derived_port = self
            .host
            .as_deref()
            .and_then(|host| normalize_target(host).ok())
            .and_then(|url| url.port_or_known_default());
        Ok(HttpProbe {
            host: self.host,
            port: self.port.or(derived_port),
            timeout: Some(self.timeout.unwrap_or(DEFAULT_TIMEOUT)),
            follow_redirect: self.follow_redirect.unwrap_or(true),
            redirect_limit: self.redirect_limit.unwrap_or(DEFAULT_REDIRECT_LIMIT),
            user_agent: self.user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            verify_tls: self.verify_tls.unwrap_or(false),
            use_get: self.use_get.unwrap_or(false),
            proxy,
        })
    }
}

/// Call-time overrides; a set field wins over the instance configuration.
#[derive(Clone, Debug, Default)]
pub struct HttpOverrides {
    pub port: Option<u16>,
    pub timeout: Option<Duration>,
}

impl HttpProbe {
    pub fn builder() -> HttpProbeBuilder {
        HttpProbeBuilder::new()
    }

    pub fn new(host: &str) -> Result<Self> {
        Self::builder().with_host(host).build()
    }
}

#[async_trait]
impl Prober for HttpProbe {
    type Overrides = HttpOverrides;

    async fn probe_with(
        &self,
        host: Option<&str>,
        overrides: HttpOverrides,
    ) -> Result<ProbeOutcome> {
        let call_host = host;
        let target = lifecycle::resolve_host(call_host, self.host.as_deref())?;
        let limit = lifecycle::resolve_timeout(overrides.timeout, self.timeout)?;

        let mut url = normalize_target(target)?;
        // Port precedence: call-time override, then the call-time URL's own
        // port, then the instance default, then the URL's scheme default.
        let port = overrides
            .port
            .or_else(|| call_host.and(url.port_or_known_default()))
            .or(self.port)
            .or_else(|| url.port_or_known_default())
            .unwrap_or(DEFAULT_PORT);
        url.set_port(Some(port)).map_err(|_| Error::InvalidUrl {
            url: target.to_string(),
            reason: "cannot carry a port".to_string(),
        })?;

        let client = match self.client(&url, limit) {
            Ok(client) => client,
            Err(err) => return Ok(ProbeOutcome::failed(err)),
        };
        let method = if self.use_get { Method::GET } else { Method::HEAD };

        let started = Instant::now();
        let mut response = match client.request(method.clone(), url.clone()).send().await {
            Ok(response) => response,
            Err(err) => return Ok(ProbeOutcome::failed(transport_error(err))),
        };

        let mut warning = None;
        if response.status().is_redirection() {
            if !self.follow_redirect {
                let status = response.status();
                return Ok(ProbeOutcome::failed(ProbeError::Status(reason_of(status)))
                    .with_status_code(status.as_u16()));
            }
            warning = Some(reason_of(response.status()));
            let mut redirects = 0;
            while response.status().is_redirection() {
                if redirects >= self.redirect_limit {
                    return Ok(ProbeOutcome::failed(ProbeError::RedirectLimitExceeded)
                        .with_status_code(response.status().as_u16()));
                }
                let code = response.status().as_u16();
                url = match next_url(&url, &response) {
                    Some(next) => next,
                    None => {
                        return Ok(ProbeOutcome::failed(ProbeError::Status(
                            "redirect without a usable Location header".to_string(),
                        ))
                        .with_status_code(code));
                    }
                };
                log::debug!("following redirect to {url}");
                response = match client.request(method.clone(), url.clone()).send().await {
                    Ok(response) => response,
                    Err(err) => return Ok(ProbeOutcome::failed(transport_error(err))),
                };
                redirects += 1;
            }
        }

        let status = response.status();
        let code = status.as_u16();
        if !status.is_success() {
            // An accumulated redirect warning does not survive a failure.
            return Ok(ProbeOutcome::failed(ProbeError::Status(reason_of(status)))
                .with_status_code(code));
        }

        let payload = match response_payload(response, self.use_get).await {
            Ok(payload) => payload,
            Err(err) => return Ok(ProbeOutcome::failed(err).with_status_code(code)),
        };
        let mut outcome = ProbeOutcome::succeeded(started.elapsed())
            .with_status_code(code)
            .with_response(payload);
        if let Some(warning) = warning {
            outcome = outcome.with_warning(warning);
        }
        Ok(outcome)
    }
}

impl HttpProbe {
    fn client(&self, url: &Url, limit: Duration) -> std::result::Result<Client, ProbeError> {
        let mut builder = Client::builder()
            .timeout(limit)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!self.verify_tls)
            .user_agent(self.user_agent.clone());
        builder = match resolve_proxy(url, self.proxy.as_ref()) {
            Some(proxy) => {
                log::debug!("proxying through {proxy}");
                match reqwest::Proxy::all(proxy.as_str()) {
                    Ok(proxy) => builder.proxy(proxy),
                    Err(err) => return Err(ProbeError::Io(err.to_string())),
                }
            }
            None => builder.no_proxy(),
        };
        builder.build().map_err(|err| ProbeError::Io(err.to_string()))
    }
}

/// Turn a URL, a scheme-relative reference, or a bare host into a fully
/// qualified URL. The scheme defaults to `http` (which pins the path to `/`
/// as well).
fn normalize_target(target: &str) -> Result<Url> {
    let absolute = if target.starts_with("//") {
        format!("http:{target}")
    } else if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{target}")
    };
    Url::parse(&absolute).map_err(|err| Error::InvalidUrl {
        url: target.to_string(),
        reason: err.to_string(),
    })
}

/// Resolve the next hop of a redirect; relative locations are joined
/// against the current URL.
fn next_url(current: &Url, response: &reqwest::Response) -> Option<Url> {
    let location = response.headers().get(reqwest::header::LOCATION)?;
    current.join(location.to_str().ok()?).ok()
}

/// The proxy for this URL: an explicitly configured one, else the
/// scheme-matching environment variable, unless `no_proxy` exempts the
/// host.
fn resolve_proxy(url: &Url, explicit: Option<&Url>) -> Option<Url> {
    if let Some(proxy) = explicit {
        return Some(proxy.clone());
    }
    let host = url.host_str()?;
    if no_proxy_exempts(host) {
        return None;
    }
    let name = if url.scheme() == "https" {
        "https_proxy"
    } else {
        "http_proxy"
    };
    let raw = env::var(name)
        .or_else(|_| env::var(name.to_uppercase()))
        .ok()
        .filter(|value| !value.is_empty())?;
    match Url::parse(&raw) {
        Ok(proxy) => Some(proxy),
        Err(err) => {
            log::debug!("ignoring unparsable {name}: {err}");
            None
        }
    }
}

fn no_proxy_exempts(host: &str) -> bool {
    let raw = match env::var("no_proxy").or_else(|_| env::var("NO_PROXY")) {
        Ok(raw) => raw,
        Err(_) => return false,
    };
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            entry == "*"
                || host == entry.trim_start_matches('.')
                || host.ends_with(&format!(".{}", entry.trim_start_matches('.')))
        })
}

fn transport_error(err: reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout
    } else {
        ProbeError::Io(err.to_string())
    }
}

fn reason_of(status: StatusCode) -> String {
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_u16().to_string())
}

/// HEAD probes record the reconstructed status line and header block; GET
/// probes record the body.
async fn response_payload(
    response: reqwest::Response,
    use_get: bool,
) -> std::result::Result<ProbePayload, ProbeError> {
    if use_get {
        return match response.text().await {
            Ok(body) => Ok(ProbePayload::Text(body)),
            Err(err) => Err(transport_error(err)),
        };
    }
    let mut head = format!(
        "{} {} {}\n",
        version_str(response.version()),
        response.status().as_u16(),
        reason_of(response.status())
    );
    for (name, value) in response.headers() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push('\n');
    }
    Ok(ProbePayload::Text(head))
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP",
    }
}
