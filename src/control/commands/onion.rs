//! ADD_ONION: register a hidden service for the connection's lifetime

use crate::control::command::Reply;
use crate::crypto::{OnionKey, KEY_BLOB_HEADER};
use crate::error::{Error, Result};
use crate::service::Target;

/// ADD_ONION request. All targets of a service go into one command, one
/// `Port=` argument each.
pub struct AddOnion<'a> {
    /// `None` asks Tor to mint a key (`NEW:BEST`).
    pub key: Option<&'a OnionKey>,
    pub targets: &'a [Target],
}

#[derive(Debug)]
pub struct AddOnionReply {
    pub service_id: String,
    /// Present only when Tor generated the key for us.
    pub key: Option<OnionKey>,
}

impl<'a> AddOnion<'a> {
    pub fn line(&self) -> String {
        let mut line = String::from("ADD_ONION ");
        match self.key {
            Some(key) => line.push_str(&key.to_key_blob()),
            None => line.push_str("NEW:BEST"),
        }
        for t in self.targets {
            line.push_str(&format!(
                " Port={},{}:{}",
                t.service_port, t.target_address, t.target_port
            ));
        }
        line
    }

    pub fn parse(reply: &Reply) -> Result<AddOnionReply> {
        reply.require_ok(Error::ServicePublishFailed)?;

        let mut service_id = None;
        let mut key = None;
        for (name, value) in reply.kv_lines() {
            match (name, value) {
                ("ServiceID", Some(id)) => service_id = Some(id.to_string()),
                ("PrivateKey", Some(blob)) => {
                    if !blob.starts_with(KEY_BLOB_HEADER) {
                        return Err(Error::ProtocolViolation(format!(
                            "ADD_ONION returned an unsupported key type: {:.16}",
                            blob
                        )));
                    }
                    key = Some(OnionKey::from_key_blob(blob).map_err(|e| {
                        Error::ProtocolViolation(format!("ADD_ONION returned a bad key: {}", e))
                    })?);
                },
                _ => {},
            }
        }

        let service_id = service_id
            .ok_or_else(|| Error::ProtocolViolation("ADD_ONION reply missing ServiceID".into()))?;

        Ok(AddOnionReply { service_id, key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::command::ReplyLine;

    fn targets() -> Vec<Target> {
        vec![
            Target {
                service_port: 9878,
                target_address: "127.0.0.1".into(),
                target_port: 7934,
            },
            Target {
                service_port: 80,
                target_address: "127.0.0.1".into(),
                target_port: 8080,
            },
        ]
    }

    #[test]
    fn new_service_line_combines_ports() {
        let targets = targets();
        let cmd = AddOnion {
            key: None,
            targets: &targets,
        };
        assert_eq!(
            cmd.line(),
            "ADD_ONION NEW:BEST Port=9878,127.0.0.1:7934 Port=80,127.0.0.1:8080"
        );
    }

    #[test]
    fn existing_key_line_uses_blob() {
        let key = OnionKey::generate();
        let targets = &targets()[..1];
        let cmd = AddOnion {
            key: Some(&key),
            targets,
        };
        let line = cmd.line();
        assert!(line.starts_with(&format!("ADD_ONION {}", key.to_key_blob())));
        assert!(line.ends_with(" Port=9878,127.0.0.1:7934"));
    }

    #[test]
    fn reply_with_generated_key() {
        let key = OnionKey::generate();
        let reply = Reply {
            status: 250,
            lines: vec![
                ReplyLine {
                    status: 250,
                    text: format!("ServiceID={}", key.service_id()),
                    data: None,
                },
                ReplyLine {
                    status: 250,
                    text: format!("PrivateKey={}", key.to_key_blob()),
                    data: None,
                },
                ReplyLine {
                    status: 250,
                    text: "OK".into(),
                    data: None,
                },
            ],
        };
        let parsed = AddOnion::parse(&reply).unwrap();
        assert_eq!(parsed.service_id, key.service_id());
        assert_eq!(parsed.key.unwrap(), key);
    }

    #[test]
    fn refusal_maps_to_publish_failure() {
        let reply = Reply {
            status: 512,
            lines: vec![ReplyLine {
                status: 512,
                text: "Invalid VIRTPORT/TARGET".into(),
                data: None,
            }],
        };
        assert!(matches!(
            AddOnion::parse(&reply),
            Err(Error::ServicePublishFailed(_))
        ));
    }

    #[test]
    fn missing_service_id_is_violation() {
        let reply = Reply {
            status: 250,
            lines: vec![ReplyLine {
                status: 250,
                text: "OK".into(),
                data: None,
            }],
        };
        assert!(matches!(
            AddOnion::parse(&reply),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
