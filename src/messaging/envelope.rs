use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::GetField;
use crate::error::DecodeError;
use crate::model::{Level, PlayerRecord, PostResult, ServerRecord, is_valid_level};

/// One logical channel per event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Level,
    Server,
    Player,
    Post,
    Toggle,
}

impl Kind {
    pub const ALL: [Kind; 5] = [Kind::Level, Kind::Server, Kind::Player, Kind::Post, Kind::Toggle];

    pub fn suffix(self) -> &'static str {
        match self {
            Kind::Level => "level",
            Kind::Server => "server",
            Kind::Player => "player",
            Kind::Post => "post",
            Kind::Toggle => "toggle",
        }
    }

    pub fn channel(self, prefix: &str) -> String {
        format!("{prefix}-{}", self.suffix())
    }

    pub fn from_channel(prefix: &str, channel: &str) -> Result<Kind, DecodeError> {
        channel
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|suffix| Kind::ALL.into_iter().find(|kind| kind.suffix() == suffix))
            .ok_or_else(|| DecodeError::UnknownChannel(channel.to_owned()))
    }
}

#[derive(Serialize, Deserialize)]
struct LevelBody {
    level: i64,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct ServerBody {
    #[serde(rename = "longID")]
    long_id: i64,
    id: Uuid,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct PlayerBody {
    #[serde(rename = "longID")]
    long_id: i64,
    id: Uuid,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostBody {
    id: i64,
    #[serde(rename = "longServerID")]
    long_server_id: i64,
    #[serde(rename = "serverID")]
    server_id: Uuid,
    server_name: String,
    #[serde(rename = "longPlayerID")]
    long_player_id: i64,
    #[serde(rename = "playerID")]
    player_id: Uuid,
    level: i64,
    level_name: String,
    message: String,
    date: i64,
}

#[derive(Serialize, Deserialize)]
struct ToggleBody {
    #[serde(rename = "playerID")]
    player_id: Uuid,
    level: i64,
}

/// Kind-specific content of an envelope.
#[derive(Debug, Clone)]
pub enum Payload {
    Level(Level),
    Server(ServerRecord),
    Player(PlayerRecord),
    Post(PostResult),
    /// `level: None` turns the player's toggle off.
    Toggle { player_id: Uuid, level: Option<u8> },
}

/// Wire value for a toggle that is off.
const TOGGLE_OFF: i64 = -1;

fn level(value: i64) -> Result<u8, DecodeError> {
    u8::try_from(value)
        .ok()
        .filter(|level| is_valid_level(*level))
        .ok_or(DecodeError::InvalidLevel(value))
}

impl Payload {
    pub fn kind(&self) -> Kind {
        match self {
            Payload::Level(_) => Kind::Level,
            Payload::Server(_) => Kind::Server,
            Payload::Player(_) => Kind::Player,
            Payload::Post(_) => Kind::Post,
            Payload::Toggle { .. } => Kind::Toggle,
        }
    }

    /// The JSON object carried on the wire, without sender tagging.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Payload::Level(l) => serde_json::to_value(LevelBody { level: l.level.into(), name: l.name.clone() }),
            Payload::Server(s) => serde_json::to_value(ServerBody {
                long_id: s.long_server_id,
                id: s.server_id,
                name: s.name.clone(),
            }),
            Payload::Player(p) => serde_json::to_value(PlayerBody { long_id: p.long_player_id, id: p.player_id }),
            Payload::Post(p) => serde_json::to_value(PostBody {
                id: p.id,
                long_server_id: p.long_server_id,
                server_id: p.server_id,
                server_name: p.server_name.clone(),
                long_player_id: p.long_player_id,
                player_id: p.player_id,
                level: p.level.into(),
                level_name: p.level_name.clone(),
                message: p.message.clone(),
                date: p.date,
            }),
            Payload::Toggle { player_id, level } => serde_json::to_value(ToggleBody {
                player_id: *player_id,
                level: level.map_or(TOGGLE_OFF, i64::from),
            }),
        }
    }

    pub fn from_value(kind: Kind, value: &Value) -> Result<Payload, DecodeError> {
        Ok(match kind {
            Kind::Level => {
                let body = LevelBody::deserialize(value)?;
                Payload::Level(Level { level: level(body.level)?, name: body.name })
            }
            Kind::Server => {
                let body = ServerBody::deserialize(value)?;
                Payload::Server(ServerRecord { long_server_id: body.long_id, server_id: body.id, name: body.name })
            }
            Kind::Player => {
                let body = PlayerBody::deserialize(value)?;
                Payload::Player(PlayerRecord { long_player_id: body.long_id, player_id: body.id })
            }
            Kind::Post => {
                let body = PostBody::deserialize(value)?;
                Payload::Post(PostResult {
                    id: body.id,
                    long_server_id: body.long_server_id,
                    server_id: body.server_id,
                    server_name: body.server_name,
                    long_player_id: body.long_player_id,
                    player_id: body.player_id,
                    level: level(body.level)?,
                    level_name: body.level_name,
                    message: body.message,
                    date: body.date,
                })
            }
            Kind::Toggle => {
                let body = ToggleBody::deserialize(value)?;
                let level = match body.level {
                    TOGGLE_OFF => None,
                    value => Some(level(value)?),
                };
                Payload::Toggle { player_id: body.player_id, level }
            }
        })
    }
}

/// A decoded, validated inbound message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Uuid,
    pub message_id: Uuid,
    pub payload: Payload,
}

/// Encodes a body with `sender` and `messageID` embedded, for transports
/// without native message properties.
pub fn encode_tagged(sender: Uuid, message_id: Uuid, payload: &Payload) -> Result<Vec<u8>, serde_json::Error> {
    let mut value = payload.to_value()?;
    if let Value::Object(map) = &mut value {
        map.insert("sender".to_owned(), Value::String(sender.to_string()));
        map.insert("messageID".to_owned(), Value::String(message_id.to_string()));
    }
    serde_json::to_vec(&value)
}

pub fn encode_body(payload: &Payload) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&payload.to_value()?)
}

pub fn parse_id(field: &str, value: Option<&str>) -> Result<Uuid, DecodeError> {
    let value = value.ok_or_else(|| DecodeError::Missing(field.to_owned()))?;
    Uuid::parse_str(value).map_err(|_| DecodeError::InvalidId {
        field: field.to_owned(),
        value: value.to_owned(),
    })
}

/// Splits a tagged body into its claimed sender, message id and the body itself.
pub fn split_tagged(bytes: &[u8]) -> Result<(Option<String>, Option<String>, Value), DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let sender = value.get_str_field("sender").ok();
    let message_id = value.get_str_field("messageID").ok();
    Ok((sender, message_id, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post() -> PostResult {
        PostResult {
            id: 7,
            long_server_id: 2,
            server_id: Uuid::new_v4(),
            server_name: "lobby".to_owned(),
            long_player_id: 11,
            player_id: Uuid::new_v4(),
            level: 3,
            level_name: "ADMIN".to_owned(),
            message: "hello".to_owned(),
            date: 1_700_000_000_000,
        }
    }

    #[test]
    fn channels_use_prefix_and_kind() {
        assert_eq!(Kind::Post.channel("staffchat"), "staffchat-post");
        assert_eq!(Kind::from_channel("staffchat", "staffchat-toggle").unwrap(), Kind::Toggle);
        assert!(Kind::from_channel("staffchat", "staffchat-nope").is_err());
        assert!(Kind::from_channel("staffchat", "other-post").is_err());
    }

    #[test]
    fn post_body_uses_wire_field_names() {
        let value = Payload::Post(post()).to_value().unwrap();
        for field in ["id", "longServerID", "serverID", "serverName", "longPlayerID", "playerID", "level", "levelName", "message", "date"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn tagged_body_carries_sender_and_message_id() {
        let sender = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let bytes = encode_tagged(sender, message_id, &Payload::Toggle { player_id: Uuid::nil(), level: Some(4) }).unwrap();

        let (claimed_sender, claimed_id, value) = split_tagged(&bytes).unwrap();
        assert_eq!(parse_id("sender", claimed_sender.as_deref()).unwrap(), sender);
        assert_eq!(parse_id("messageID", claimed_id.as_deref()).unwrap(), message_id);

        let Payload::Toggle { player_id, level } = Payload::from_value(Kind::Toggle, &value).unwrap() else {
            panic!("expected toggle");
        };
        assert_eq!(player_id, Uuid::nil());
        assert_eq!(level, Some(4));
    }

    #[test]
    fn toggle_off_is_minus_one() {
        let value = Payload::Toggle { player_id: Uuid::nil(), level: None }.to_value().unwrap();
        assert_eq!(value["level"], -1);
        let Payload::Toggle { level, .. } = Payload::from_value(Kind::Toggle, &value).unwrap() else {
            panic!("expected toggle");
        };
        assert_eq!(level, None);
    }

    #[test]
    fn post_decodes_back() {
        let sent = post();
        let value = Payload::Post(sent.clone()).to_value().unwrap();
        let Payload::Post(decoded) = Payload::from_value(Kind::Post, &value).unwrap() else {
            panic!("expected post");
        };
        assert_eq!(decoded.id, sent.id);
        assert_eq!(decoded.server_id, sent.server_id);
        assert_eq!(decoded.level_name, "ADMIN");
    }

    #[test]
    fn rejects_bad_ids_and_levels() {
        assert!(matches!(parse_id("sender", None), Err(DecodeError::Missing(_))));
        assert!(matches!(parse_id("sender", Some("not-a-uuid")), Err(DecodeError::InvalidId { .. })));

        let value = serde_json::json!({"level": 200, "name": "x"});
        assert!(matches!(Payload::from_value(Kind::Level, &value), Err(DecodeError::InvalidLevel(200))));

        let value = serde_json::json!({"longID": 1});
        assert!(matches!(Payload::from_value(Kind::Player, &value), Err(DecodeError::Json(_))));
    }
}
