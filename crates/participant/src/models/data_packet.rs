use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::info::SpeakerInfo;

/// Reliability class of a data packet. On receive the carrying channel is the
/// source of truth and overwrites whatever the wire says.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
pub enum DataPacketKind {
    Reliable = 0,
    Lossy = 1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPacket {
    pub kind: DataPacketKind,
    #[serde(flatten)]
    pub value: DataPacketValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataPacketValue {
    User(UserPacket),
    Speaker(ActiveSpeakerUpdate),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPacket {
    pub participant_sid: String,
    pub payload: Vec<u8>,
    pub destination_sids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSpeakerUpdate {
    pub speakers: Vec<SpeakerInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_packet_round_trip() {
        let packet = DataPacket {
            kind: DataPacketKind::Lossy,
            value: DataPacketValue::User(UserPacket {
                participant_sid: "PA_abc".to_owned(),
                payload: b"hello".to_vec(),
                destination_sids: vec![],
            }),
        };

        let bytes = serde_json::to_vec(&packet).unwrap();
        let decoded: DataPacket = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.kind, DataPacketKind::Lossy);
        match decoded.value {
            DataPacketValue::User(user) => {
                assert_eq!(user.participant_sid, "PA_abc");
                assert_eq!(user.payload, b"hello");
            }
            _ => panic!("expected user payload"),
        }
    }
}
