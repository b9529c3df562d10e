use crate::error::Result;
use crate::proxy::IpMatcher;
use std::net::IpAddr;

/// Client addresses exempt from every throttle
#[derive(Debug, Clone, Default)]
pub struct Safelist {
    matchers: Vec<IpMatcher>,
}

impl Safelist {
    /// Build from `trusted_ips`; any unparseable entry is an error
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let matchers = entries
            .iter()
            .map(|entry| entry.as_ref().parse())
            .collect::<Result<Vec<IpMatcher>>>()?;
        Ok(Self { matchers })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.matchers.iter().any(|m| m.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }
}
