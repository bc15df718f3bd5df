//! GETCONF / GETINFO / SETCONF / SETEVENTS / TAKEOWNERSHIP

use crate::control::command::{quote_arg, Reply};
use crate::error::{Error, Result};

/// GETCONF and GETINFO share reply shape: one `key=value` line per value,
/// multi-valued keys repeated in order, large values in data blocks.
pub struct GetConf {
    verb: &'static str,
    keys: Vec<String>,
}

impl GetConf {
    pub fn conf<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            verb: "GETCONF",
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn info<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            verb: "GETINFO",
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn line(&self) -> String {
        let mut line = self.verb.to_string();
        for key in &self.keys {
            line.push(' ');
            line.push_str(key);
        }
        line
    }

    pub fn parse(reply: &Reply) -> Result<ConfValues> {
        reply.require_ok(|msg| Error::ProtocolViolation(format!("configuration query refused: {}", msg)))?;

        let mut values = Vec::new();
        for line in &reply.lines {
            if line.text == "OK" {
                continue;
            }
            let (key, value) = match line.text.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                // A bare key means the option is at its default.
                None => (line.text.clone(), None),
            };
            let value = match (&line.data, value) {
                // Data-block form: the value is the block content.
                (Some(data), _) => Some(data.join("\n")),
                (None, v) => v,
            };
            values.push((key, value));
        }
        Ok(ConfValues { values })
    }
}

/// Order-preserving multi-map of reply values.
#[derive(Debug, Clone, Default)]
pub struct ConfValues {
    values: Vec<(String, Option<String>)>,
}

impl ConfValues {
    /// All values for `key`, in reply order. Defaulted keys yield "".
    pub fn get(&self, key: &str) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
            .collect()
    }

    /// First value for `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }
}

/// SETCONF: all pairs applied atomically.
pub struct SetConf {
    pairs: Vec<(String, String)>,
}

impl SetConf {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            pairs: vec![(key.into(), value.into())],
        }
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    pub fn line(&self) -> String {
        let mut line = "SETCONF".to_string();
        for (key, value) in &self.pairs {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&quote_arg(value));
        }
        line
    }

    pub fn parse(reply: &Reply) -> Result<()> {
        reply.require_ok(|msg| Error::ProtocolViolation(format!("SETCONF refused: {}", msg)))
    }
}

/// SETEVENTS: the subscription set replaces the previous one.
pub struct SetEvents {
    events: Vec<String>,
}

impl SetEvents {
    pub fn new<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            events: events.into_iter().map(Into::into).collect(),
        }
    }

    pub fn line(&self) -> String {
        let mut line = "SETEVENTS".to_string();
        for ev in &self.events {
            line.push(' ');
            line.push_str(&ev.to_ascii_uppercase());
        }
        line
    }

    pub fn parse(reply: &Reply) -> Result<()> {
        reply.require_ok(|msg| Error::ProtocolViolation(format!("SETEVENTS refused: {}", msg)))
    }
}

/// TAKEOWNERSHIP: Tor exits when this control connection closes.
pub struct TakeOwnership;

impl TakeOwnership {
    pub fn line() -> String {
        "TAKEOWNERSHIP".to_string()
    }

    pub fn parse(reply: &Reply) -> Result<()> {
        reply.require_ok(|msg| Error::ProtocolViolation(format!("TAKEOWNERSHIP refused: {}", msg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::command::ReplyLine;

    fn line(text: &str) -> ReplyLine {
        ReplyLine {
            status: 250,
            text: text.to_string(),
            data: None,
        }
    }

    #[test]
    fn multi_value_order_preserved() {
        let reply = Reply {
            status: 250,
            lines: vec![line("k=v1"), line("k=v2"), line("OK")],
        };
        let values = GetConf::parse(&reply).unwrap();
        assert_eq!(values.get("k"), vec!["v1", "v2"]);
    }

    #[test]
    fn defaulted_key_is_empty() {
        let reply = Reply {
            status: 250,
            lines: vec![line("SocksPort"), line("OK")],
        };
        let values = GetConf::parse(&reply).unwrap();
        assert_eq!(values.get("SocksPort"), vec![""]);
        assert_eq!(values.first("SocksPort"), Some(""));
    }

    #[test]
    fn data_block_value() {
        let reply = Reply {
            status: 250,
            lines: vec![
                ReplyLine {
                    status: 250,
                    text: "config-text=".into(),
                    data: Some(vec!["SocksPort auto".into(), "AvoidDiskWrites 1".into()]),
                },
                line("OK"),
            ],
        };
        let values = GetConf::parse(&reply).unwrap();
        assert_eq!(
            values.first("config-text"),
            Some("SocksPort auto\nAvoidDiskWrites 1")
        );
    }

    #[test]
    fn request_lines() {
        assert_eq!(
            GetConf::conf(["DisableNetwork", "SocksPort"]).line(),
            "GETCONF DisableNetwork SocksPort"
        );
        assert_eq!(
            GetConf::info(["status/bootstrap-phase"]).line(),
            "GETINFO status/bootstrap-phase"
        );
        assert_eq!(
            SetConf::new("__OwningControllerProcess", "1234").line(),
            "SETCONF __OwningControllerProcess=1234"
        );
        assert_eq!(
            SetConf::new("Nickname", "a relay").line(),
            "SETCONF Nickname=\"a relay\""
        );
        assert_eq!(
            SetEvents::new(["status_client", "HS_DESC"]).line(),
            "SETEVENTS STATUS_CLIENT HS_DESC"
        );
        assert_eq!(TakeOwnership::line(), "TAKEOWNERSHIP");
    }

    #[test]
    fn refusal_is_surfaced() {
        let reply = Reply {
            status: 552,
            lines: vec![ReplyLine {
                status: 552,
                text: "Unrecognized configuration key \"bogus\"".into(),
                data: None,
            }],
        };
        assert!(matches!(
            GetConf::parse(&reply),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
