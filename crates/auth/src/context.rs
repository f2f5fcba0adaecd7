//! Request facts a token can be bound to.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};

/// Clock reading plus the client facts of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub now: DateTime<Utc>,
    pub ip: IpAddr,
    pub user_agent: String,
    pub session_id: Option<String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            now: Utc::now(),
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            user_agent: String::new(),
            session_id: None,
        }
    }
}

impl RequestContext {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            ..Default::default()
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Build a context from raw request headers.
    ///
    /// The client IP is the first candidate that parses, in this order:
    /// `Client-IP` (only when the remote address is known), the remote
    /// address, `Client-IP`, the last hop of `X-Forwarded-For`. Falls back to
    /// `0.0.0.0`. Header names are matched case-insensitively.
    pub fn from_headers<'a>(
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
        remote_addr: Option<&str>,
        session_id: Option<String>,
    ) -> Self {
        let mut client_ip = None;
        let mut forwarded_for = None;
        let mut user_agent = String::new();
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("client-ip") {
                client_ip = Some(value);
            } else if name.eq_ignore_ascii_case("x-forwarded-for") {
                forwarded_for = Some(value);
            } else if name.eq_ignore_ascii_case("user-agent") {
                user_agent = value.to_string();
            }
        }

        let remote = remote_addr.filter(|r| !r.trim().is_empty());
        let last_hop = forwarded_for.and_then(|v| v.rsplit(',').next());
        let candidates = [remote.and(client_ip), remote, client_ip, last_hop];
        let ip = candidates
            .into_iter()
            .flatten()
            .find_map(|c| c.trim().parse::<IpAddr>().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        Self {
            now: Utc::now(),
            ip,
            user_agent,
            session_id,
        }
    }
}
