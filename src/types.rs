use serde::{Serialize, Serializer};

/// 分類結果（ラベルと確信度[%]）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub label: String,
    /// 0〜100。シリアライズ時は小数第2位に丸める
    #[serde(serialize_with = "serialize_rounded")]
    pub confidence: f64,
}

impl ClassificationResult {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    /// 小数第2位に丸めた確信度
    pub fn rounded_confidence(&self) -> f64 {
        round_two_decimals(self.confidence)
    }
}

pub fn round_two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn serialize_rounded<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round_two_decimals(*value))
}
