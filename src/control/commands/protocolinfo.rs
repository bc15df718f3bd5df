//! PROTOCOLINFO: discover authentication methods and the cookie file

use crate::control::command::{find_arg, split_quoted, Reply};
use crate::control::commands::auth::AuthMethod;
use crate::error::{Error, Result};
use std::path::PathBuf;

pub struct ProtocolInfo;

#[derive(Debug, Clone)]
pub struct ProtocolInfoReply {
    pub methods: Vec<AuthMethod>,
    pub cookie_file: Option<PathBuf>,
}

impl ProtocolInfo {
    pub fn line() -> String {
        // Version 1 is the only one defined.
        "PROTOCOLINFO 1".to_string()
    }

    pub fn parse(reply: &Reply) -> Result<ProtocolInfoReply> {
        reply.require_ok(Error::AuthFailed)?;

        let auth_line = reply
            .lines
            .iter()
            .find(|l| l.text.starts_with("AUTH "))
            .ok_or_else(|| Error::ProtocolViolation("PROTOCOLINFO reply without AUTH line".into()))?;

        let tokens = split_quoted(&auth_line.text);
        let methods_arg = find_arg(&tokens, "METHODS")
            .ok_or_else(|| Error::ProtocolViolation("AUTH line without METHODS".into()))?;

        let methods: Vec<AuthMethod> = methods_arg
            .split(',')
            .filter_map(AuthMethod::from_wire)
            .collect();

        let cookie_file = find_arg(&tokens, "COOKIEFILE").map(PathBuf::from);

        Ok(ProtocolInfoReply {
            methods,
            cookie_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::command::ReplyLine;

    fn reply_with(lines: &[&str]) -> Reply {
        Reply {
            status: 250,
            lines: lines
                .iter()
                .map(|t| ReplyLine {
                    status: 250,
                    text: (*t).to_string(),
                    data: None,
                })
                .collect(),
        }
    }

    #[test]
    fn parses_methods_and_cookie() {
        let reply = reply_with(&[
            "PROTOCOLINFO 1",
            r#"AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/run/tor/control auth cookie""#,
            r#"VERSION Tor="0.4.8.9""#,
            "OK",
        ]);
        let info = ProtocolInfo::parse(&reply).unwrap();
        assert_eq!(info.methods, vec![AuthMethod::Cookie, AuthMethod::SafeCookie]);
        assert_eq!(
            info.cookie_file.unwrap().to_str().unwrap(),
            "/run/tor/control auth cookie"
        );
    }

    #[test]
    fn null_auth_without_cookie() {
        let reply = reply_with(&["PROTOCOLINFO 1", "AUTH METHODS=NULL", "OK"]);
        let info = ProtocolInfo::parse(&reply).unwrap();
        assert_eq!(info.methods, vec![AuthMethod::Null]);
        assert!(info.cookie_file.is_none());
    }

    #[test]
    fn unknown_methods_are_skipped() {
        let reply = reply_with(&["AUTH METHODS=HASHEDPASSWORD,FANCYNEWTHING", "OK"]);
        let info = ProtocolInfo::parse(&reply).unwrap();
        assert_eq!(info.methods, vec![AuthMethod::HashedPassword]);
    }

    #[test]
    fn missing_auth_line_is_violation() {
        let reply = reply_with(&["PROTOCOLINFO 1", "OK"]);
        assert!(matches!(
            ProtocolInfo::parse(&reply),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
