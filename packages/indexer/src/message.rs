//! Decoded Message Kinds
//!
//! Maps amino message type names to the kinds the classifier understands and
//! converts raw message payloads into typed transfers and trades.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::Deserialize;

use crate::types::{de_u128, Coin};

/// Message type names the indexer recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// cosmos-sdk/Send - inputs/outputs transfer
    Send,
    /// cosmos-sdk/MsgMultiSend - inputs/outputs transfer
    MultiSend,
    /// cosmos-sdk/MsgSend - single sender/recipient transfer
    MsgSend,
    /// clp/MsgTrade - pool trade
    Trade,
}

impl MessageKind {
    /// Returns the amino type name
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::Send => "cosmos-sdk/Send",
            MessageKind::MultiSend => "cosmos-sdk/MsgMultiSend",
            MessageKind::MsgSend => "cosmos-sdk/MsgSend",
            MessageKind::Trade => "clp/MsgTrade",
        }
    }
}

/// Static lookup table for message type names
static MESSAGE_KINDS: LazyLock<HashMap<&'static str, MessageKind>> = LazyLock::new(|| {
    [
        MessageKind::Send,
        MessageKind::MultiSend,
        MessageKind::MsgSend,
        MessageKind::Trade,
    ]
    .into_iter()
    .map(|kind| (kind.type_name(), kind))
    .collect()
});

/// Get the message kind for an amino type name, if it is one we handle
pub fn message_kind(type_name: &str) -> Option<MessageKind> {
    MESSAGE_KINDS.get(type_name).copied()
}

/// One side of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferLeg {
    pub address: String,
    #[serde(default)]
    pub coins: Vec<Coin>,
}

/// Coins moved from input accounts to output accounts
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Transfer {
    #[serde(default)]
    pub inputs: Vec<TransferLeg>,
    #[serde(default)]
    pub outputs: Vec<TransferLeg>,
}

impl Transfer {
    /// The input and output of a one-to-one, single-coin transfer
    pub fn single_leg(&self) -> Option<(&TransferLeg, &TransferLeg)> {
        match (self.inputs.as_slice(), self.outputs.as_slice()) {
            ([input], [output]) if input.coins.len() == 1 && output.coins.len() == 1 => {
                Some((input, output))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MsgSendValue {
    from_address: String,
    to_address: String,
    #[serde(default)]
    amount: Vec<Coin>,
}

impl From<MsgSendValue> for Transfer {
    fn from(msg: MsgSendValue) -> Self {
        Transfer {
            inputs: vec![TransferLeg {
                address: msg.from_address,
                coins: msg.amount.clone(),
            }],
            outputs: vec![TransferLeg {
                address: msg.to_address,
                coins: msg.amount,
            }],
        }
    }
}

/// Exchange of one ticker for another through a pool
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Trade {
    pub sender: String,
    pub from_ticker: String,
    #[serde(deserialize_with = "de_u128")]
    pub from_amount: u128,
    pub to_ticker: String,
}

/// A classified message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Transfer(Transfer),
    Trade(Trade),
    /// Any other message type, carried by name only
    Other(String),
}

/// Message as emitted by the decoder: `{"type": ..., "value": {...}}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawMessage {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl RawMessage {
    /// Convert the payload into a typed message
    pub fn into_message(self) -> Result<Message, serde_json::Error> {
        let Some(kind) = message_kind(&self.type_name) else {
            return Ok(Message::Other(self.type_name));
        };
        Ok(match kind {
            MessageKind::Send | MessageKind::MultiSend => {
                Message::Transfer(serde_json::from_value(self.value)?)
            }
            MessageKind::MsgSend => {
                let msg: MsgSendValue = serde_json::from_value(self.value)?;
                Message::Transfer(msg.into())
            }
            MessageKind::Trade => Message::Trade(serde_json::from_value(self.value)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(type_name: &str, value: serde_json::Value) -> RawMessage {
        RawMessage {
            type_name: type_name.to_string(),
            value,
        }
    }

    // ==================== message_kind tests ====================

    #[test]
    fn test_lookup_known_kinds() {
        assert_eq!(message_kind("cosmos-sdk/Send"), Some(MessageKind::Send));
        assert_eq!(message_kind("cosmos-sdk/MsgMultiSend"), Some(MessageKind::MultiSend));
        assert_eq!(message_kind("cosmos-sdk/MsgSend"), Some(MessageKind::MsgSend));
        assert_eq!(message_kind("clp/MsgTrade"), Some(MessageKind::Trade));
    }

    #[test]
    fn test_lookup_unknown_kind() {
        assert_eq!(message_kind("cosmos-sdk/MsgDelegate"), None);
        assert_eq!(message_kind(""), None);
    }

    #[test]
    fn test_type_name_round_trips_through_table() {
        for kind in [
            MessageKind::Send,
            MessageKind::MultiSend,
            MessageKind::MsgSend,
            MessageKind::Trade,
        ] {
            assert_eq!(message_kind(kind.type_name()), Some(kind));
        }
    }

    // ==================== into_message tests ====================

    #[test]
    fn test_send_becomes_transfer() {
        let msg = raw(
            "cosmos-sdk/Send",
            json!({
                "inputs": [{"address": "A", "coins": [{"denom": "RUNE", "amount": "50"}]}],
                "outputs": [{"address": "B", "coins": [{"denom": "RUNE", "amount": "50"}]}]
            }),
        )
        .into_message()
        .unwrap();

        let Message::Transfer(transfer) = msg else {
            panic!("expected transfer");
        };
        let (input, output) = transfer.single_leg().unwrap();
        assert_eq!(input.address, "A");
        assert_eq!(output.address, "B");
        assert_eq!(input.coins[0], Coin::new("RUNE", 50));
    }

    #[test]
    fn test_msg_send_is_normalized_to_one_leg_each() {
        let msg = raw(
            "cosmos-sdk/MsgSend",
            json!({
                "from_address": "A",
                "to_address": "B",
                "amount": [{"denom": "RUNE", "amount": "7"}]
            }),
        )
        .into_message()
        .unwrap();

        let Message::Transfer(transfer) = msg else {
            panic!("expected transfer");
        };
        assert_eq!(transfer.inputs.len(), 1);
        assert_eq!(transfer.outputs.len(), 1);
        assert_eq!(transfer.outputs[0].coins, vec![Coin::new("RUNE", 7)]);
    }

    #[test]
    fn test_trade_payload() {
        let msg = raw(
            "clp/MsgTrade",
            json!({"sender": "C", "from_ticker": "FOO", "from_amount": "10", "to_ticker": "RUNE"}),
        )
        .into_message()
        .unwrap();

        assert_eq!(
            msg,
            Message::Trade(Trade {
                sender: "C".into(),
                from_ticker: "FOO".into(),
                from_amount: 10,
                to_ticker: "RUNE".into(),
            })
        );
    }

    #[test]
    fn test_unknown_type_is_other() {
        let msg = raw("cosmos-sdk/MsgDelegate", json!({})).into_message().unwrap();
        assert_eq!(msg, Message::Other("cosmos-sdk/MsgDelegate".into()));
    }

    #[test]
    fn test_malformed_trade_is_error() {
        let result = raw("clp/MsgTrade", json!({"sender": "C"})).into_message();
        assert!(result.is_err());
    }

    // ==================== single_leg tests ====================

    #[test]
    fn test_single_leg_rejects_multi_output() {
        let transfer = Transfer {
            inputs: vec![TransferLeg {
                address: "A".into(),
                coins: vec![Coin::new("RUNE", 2)],
            }],
            outputs: vec![
                TransferLeg {
                    address: "B".into(),
                    coins: vec![Coin::new("RUNE", 1)],
                },
                TransferLeg {
                    address: "C".into(),
                    coins: vec![Coin::new("RUNE", 1)],
                },
            ],
        };
        assert!(transfer.single_leg().is_none());
    }

    #[test]
    fn test_single_leg_rejects_multi_coin() {
        let coins = vec![Coin::new("RUNE", 1), Coin::new("FOO", 1)];
        let transfer = Transfer {
            inputs: vec![TransferLeg {
                address: "A".into(),
                coins: coins.clone(),
            }],
            outputs: vec![TransferLeg {
                address: "B".into(),
                coins,
            }],
        };
        assert!(transfer.single_leg().is_none());
    }
}
