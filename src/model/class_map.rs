//! クラスインデックスとジェスチャーラベルの対応表
//!
//! JSON形式: `{"0": "fist", "1": "palm", ...}`

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

/// チェックポイントディレクトリ内のクラスマップファイル名
pub const CLASS_MAP_FILE: &str = "class_map.json";

#[derive(Debug, Error)]
pub enum ClassMapError {
    #[error("class map is empty")]
    Empty,
    #[error("class map key {0:?} is not a class index")]
    InvalidKey(String),
    #[error("class map is missing index {0}")]
    MissingIndex(usize),
    #[error("class map has index {0} more than once")]
    Duplicate(usize),
    #[error("class map has an empty label at index {0}")]
    EmptyLabel(usize),
    #[error("class map has {expected} classes but the model outputs {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("failed to parse class map: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to access class map file: {0}")]
    Io(#[from] std::io::Error),
}

/// インデックス順に並んだラベル一覧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMap {
    labels: Vec<String>,
}

impl ClassMap {
    /// i番目のラベルをインデックスiに割り当てる
    pub fn from_labels(labels: Vec<String>) -> Self {
        Self { labels }
    }

    /// JSON文字列から読み込む
    ///
    /// `{"0": "fist"}`（インデックス → ラベル）と `{"fist": 0}`（ラベル → インデックス）の両方を受け付ける。
    /// インデックスが 0..C-1 をちょうど網羅していない場合はエラー。
    pub fn from_json_str(json: &str) -> Result<Self, ClassMapError> {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
        if raw.is_empty() {
            return Err(ClassMapError::Empty);
        }

        let label_to_index = raw.values().all(|v| v.is_u64());
        let mut by_index = BTreeMap::new();
        for (key, value) in raw {
            let (index, label) = if label_to_index {
                let index = value
                    .as_u64()
                    .ok_or_else(|| ClassMapError::InvalidKey(key.clone()))?
                    as usize;
                (index, key)
            } else {
                let index: usize = key
                    .trim()
                    .parse()
                    .map_err(|_| ClassMapError::InvalidKey(key.clone()))?;
                let label = value
                    .as_str()
                    .ok_or_else(|| ClassMapError::InvalidKey(key.clone()))?
                    .to_string();
                (index, label)
            };
            if label.trim().is_empty() {
                return Err(ClassMapError::EmptyLabel(index));
            }
            if by_index.insert(index, label).is_some() {
                // "1" と "01" のような重複
                return Err(ClassMapError::Duplicate(index));
            }
        }

        let count = by_index.len();
        let mut labels = Vec::with_capacity(count);
        for (expected, (index, label)) in by_index.into_iter().enumerate() {
            if index != expected {
                return Err(ClassMapError::MissingIndex(expected));
            }
            labels.push(label);
        }

        Ok(Self { labels })
    }

    pub fn load(path: &Path) -> Result<Self, ClassMapError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// キーを数値の昇順で並べたJSON文字列
    pub fn to_json_string(&self) -> Result<String, ClassMapError> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn save(&self, path: &Path) -> Result<(), ClassMapError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// モデル出力次元との整合性を確認
    pub fn ensure_output_dim(&self, dim: usize) -> Result<(), ClassMapError> {
        if self.labels.is_empty() {
            return Err(ClassMapError::Empty);
        }
        if self.labels.len() != dim {
            return Err(ClassMapError::DimensionMismatch {
                expected: self.labels.len(),
                actual: dim,
            });
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

impl Serialize for ClassMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.labels.len()))?;
        for (index, label) in self.labels.iter().enumerate() {
            map.serialize_entry(&index.to_string(), label)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_out_of_order_keys() {
        let map = ClassMap::from_json_str(r#"{"2": "thumbs_up", "0": "fist", "1": "palm"}"#).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(0), Some("fist"));
        assert_eq!(map.get(2), Some("thumbs_up"));
        assert_eq!(map.get(3), None);
        assert!(map.contains_label("palm"));
    }

    #[test]
    fn test_parse_label_to_index_form() {
        let map = ClassMap::from_json_str(r#"{"palm": 1, "fist": 0}"#).unwrap();
        assert_eq!(map.labels(), &["fist".to_string(), "palm".to_string()]);

        let err = ClassMap::from_json_str(r#"{"palm": 2, "fist": 0}"#).unwrap_err();
        assert!(matches!(err, ClassMapError::MissingIndex(1)));
    }

    #[test]
    fn test_missing_index_is_rejected() {
        let err = ClassMap::from_json_str(r#"{"0": "fist", "2": "palm"}"#).unwrap_err();
        assert!(matches!(err, ClassMapError::MissingIndex(1)));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            ClassMap::from_json_str("{}").unwrap_err(),
            ClassMapError::Empty
        ));
        assert!(matches!(
            ClassMap::from_json_str(r#"{"zero": "fist"}"#).unwrap_err(),
            ClassMapError::InvalidKey(_)
        ));
        assert!(matches!(
            ClassMap::from_json_str(r#"{"0": ""}"#).unwrap_err(),
            ClassMapError::EmptyLabel(0)
        ));
        assert!(matches!(
            ClassMap::from_json_str("[1, 2]").unwrap_err(),
            ClassMapError::Parse(_)
        ));
    }

    #[test]
    fn test_json_roundtrip_keeps_order() {
        let labels: Vec<String> = (0..12).map(|i| format!("gesture_{}", i)).collect();
        let map = ClassMap::from_labels(labels);
        let json = map.to_json_string().unwrap();

        // "10" が "2" より前に来ないこと
        assert!(json.find("\"2\"").unwrap() < json.find("\"10\"").unwrap());
        assert_eq!(ClassMap::from_json_str(&json).unwrap(), map);
    }

    #[test]
    fn test_json_escapes_labels() {
        let map = ClassMap::from_labels(vec!["say \"hi\"".into(), "back\\slash\n".into()]);
        let json = map.to_json_string().unwrap();

        assert!(json.starts_with("{\n  \"0\": "));
        assert_eq!(ClassMap::from_json_str(&json).unwrap(), map);
    }

    #[test]
    fn test_ensure_output_dim() {
        let map = ClassMap::from_labels(vec!["fist".into(), "palm".into()]);
        assert!(map.ensure_output_dim(2).is_ok());
        assert!(matches!(
            map.ensure_output_dim(3).unwrap_err(),
            ClassMapError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }
}
