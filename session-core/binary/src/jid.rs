use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const SERVER_JID: &str = "s.whatsapp.net";
pub const HIDDEN_USER_SERVER: &str = "lid";
pub const HOSTED_SERVER: &str = "hosted";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("Invalid JID format: {0}")]
    InvalidFormat(String),
    #[error("Failed to parse component: {0}")]
    Parse(#[from] std::num::ParseIntError),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Jid {
    pub user: String,
    pub server: String,
    pub agent: u8,
    pub device: u16,
}

impl Jid {
    pub fn new(user: &str, server: &str) -> Self {
        Self {
            user: user.to_string(),
            server: server.to_string(),
            ..Default::default()
        }
    }

    pub fn server_jid() -> Self {
        Self::new("", SERVER_JID)
    }

    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    pub fn is_lid(&self) -> bool {
        self.server == HIDDEN_USER_SERVER
    }

    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            ..Default::default()
        }
    }

    /// The same identity with the device index replaced.
    pub fn with_device(&self, device: u16) -> Self {
        Self {
            device,
            ..self.clone()
        }
    }

    /// Signal address name: `{user}[:device]@{server}`, phone numbers on `c.us`.
    pub fn to_signal_address_string(&self) -> String {
        let device_part = if self.device != 0 {
            format!(":{}", self.device)
        } else {
            String::new()
        };
        let server = match self.server.as_str() {
            DEFAULT_USER_SERVER => "c.us",
            other => other,
        };
        format!("{}{device_part}@{server}", self.user)
    }

    /// Key under which identity records are stored (`{signal address}.0`).
    pub fn to_protocol_address_string(&self) -> String {
        format!("{}.0", self.to_signal_address_string())
    }
}

impl FromStr for Jid {
    type Err = JidError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_part, server) = match s.split_once('@') {
            Some((u, s)) => (u, s.to_string()),
            None => ("", s.to_string()),
        };

        if server.is_empty() {
            return Err(JidError::InvalidFormat(s.to_string()));
        }
        if user_part.is_empty() {
            return Ok(Jid::new("", &server));
        }

        // LID users may contain dots, so only the device suffix is split off.
        if server == HIDDEN_USER_SERVER {
            let (user, device) = match user_part.rsplit_once(':') {
                Some((u, d_str)) => (u, d_str.parse()?),
                None => (user_part, 0),
            };
            return Ok(Jid {
                user: user.to_string(),
                server,
                device,
                agent: 0,
            });
        }

        let mut user = user_part;
        let mut device = 0;
        let mut agent = 0;

        if let Some((u, d_str)) = user_part.rsplit_once(':') {
            user = u;
            device = d_str.parse()?;
            if let Some((u, a_str)) = user.rsplit_once('.') {
                user = u;
                agent = a_str.parse()?;
            }
        } else if let Some((u, last_part)) = user_part.rsplit_once('.')
            && let Ok(num_val) = last_part.parse::<u8>()
        {
            user = u;
            agent = num_val;
        }

        Ok(Jid {
            user: user.to_string(),
            server,
            agent,
            device,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.server)
        } else {
            write!(f, "{}", self.user)?;
            if self.agent > 0 {
                write!(f, ".{}", self.agent)?;
            }
            if self.device > 0 {
                write!(f, ":{}", self.device)?;
            }
            write!(f, "@{}", self.server)
        }
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::from_str(&value)
    }
}
