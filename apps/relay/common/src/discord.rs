use crate::{ChatAuthor, ChatEvent, ServiceError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const CDN_URL: &str = "https://cdn.discordapp.com";

/// Gateway intents: GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT.
pub const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);

pub struct Opcode;

impl Opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
pub struct Ready {
    pub session_id: String,
    pub resume_gateway_url: String,
    pub user: GatewayUser,
}

#[derive(Debug, Deserialize)]
pub struct GatewayUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl GatewayUser {
    pub fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some(d) if d != "0" => format!("{}#{}", self.username, d),
            _ => self.username.clone(),
        }
    }

    /// CDN URL for the user's avatar, `None` when no custom avatar is set.
    pub fn avatar_url(&self) -> Option<String> {
        self.avatar.as_ref().map(|hash| {
            let ext = if hash.starts_with("a_") { "gif" } else { "png" };
            format!("{}/avatars/{}/{}.{}", CDN_URL, self.id, hash, ext)
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageCreate {
    pub id: String,
    pub channel_id: String,
    pub author: GatewayUser,
    #[serde(default)]
    pub content: String,
}

impl From<MessageCreate> for ChatEvent {
    fn from(message: MessageCreate) -> Self {
        let avatar_url = message.author.avatar_url();
        ChatEvent {
            id: message.id,
            channel_id: message.channel_id,
            author: ChatAuthor {
                name: message.author.username,
                is_bot: message.author.bot,
                avatar_url,
            },
            content: message.content,
        }
    }
}

pub fn parse_payload(text: &str) -> Result<GatewayPayload, ServiceError> {
    Ok(serde_json::from_str(text)?)
}

pub fn parse_message_create(data: Value) -> Result<ChatEvent, ServiceError> {
    let message: MessageCreate = serde_json::from_value(data)?;
    Ok(message.into())
}

pub fn heartbeat(sequence: Option<u64>) -> String {
    json!({ "op": Opcode::HEARTBEAT, "d": sequence }).to_string()
}

pub fn identify(token: &str) -> String {
    json!({
        "op": Opcode::IDENTIFY,
        "d": {
            "token": token,
            "intents": INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "relay",
                "device": "relay",
            }
        }
    })
    .to_string()
}

pub fn resume(token: &str, session_id: &str, sequence: u64) -> String {
    json!({
        "op": Opcode::RESUME,
        "d": {
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        }
    })
    .to_string()
}

/// Close codes after which reconnecting cannot succeed.
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4010..=4014)
}
