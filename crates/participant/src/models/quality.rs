use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

#[repr(u8)]
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
pub enum ConnectionQuality {
    Poor = 0,
    Good = 1,
    Excellent = 2,
}

impl ConnectionQuality {
    /// Rates a connection from the mean publish/subscribe loss percentage and
    /// whether either direction runs below its optimal layer.
    pub fn rate(avg_loss: f32, reduced_pub: bool, reduced_sub: bool) -> Self {
        if avg_loss >= 4.0 {
            return ConnectionQuality::Poor;
        }
        if avg_loss <= 2.0 && !reduced_pub && !reduced_sub {
            return ConnectionQuality::Excellent;
        }
        ConnectionQuality::Good
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionQualityInfo {
    pub participant_sid: String,
    pub quality: ConnectionQuality,
}
