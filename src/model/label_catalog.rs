//! クラスラベル一覧
//!
//! 1行1ラベルのテキストファイルから読み込み、クラスインデックスで引けるようにします。
//! 範囲外のインデックスはエラーにせず `Unknown (<index>)` を返します。

use std::path::Path;

use crate::error::{ClassifierError, ResourceKind, Result};

/// クラスラベル一覧（インデックス = クラスID）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelCatalog {
    labels: Vec<String>,
}

impl LabelCatalog {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// テキストからラベルを読み込む（前後の空白を除去し、空行は無視）
    pub fn parse(content: &str) -> Self {
        let labels = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self { labels }
    }

    /// ファイルからラベルを読み込む
    ///
    /// ファイルが存在しない場合は `ResourceMissing` を返します。
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ClassifierError::ResourceMissing {
                kind: ResourceKind::Labels,
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|source| ClassifierError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::parse(&content);
        tracing::info!("{} クラスを読み込みました: {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// ファイルが無ければ警告を出して空の一覧を返す
    pub fn load_or_empty(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(ClassifierError::ResourceMissing { .. }) => {
                tracing::warn!("クラスファイルが見つかりません: {}", path.display());
                Ok(Self::empty())
            }
            other => other,
        }
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

    /// 分類ヘッドの出力幅（空ならフォールバック値）
    pub fn model_width(&self, fallback: usize) -> usize {
        if self.labels.is_empty() {
            fallback
        } else {
            self.labels.len()
        }
    }

    /// クラスインデックスからラベルを取得
    pub fn lookup(&self, index: usize) -> String {
        match self.labels.get(index) {
            Some(label) => label.clone(),
            None => format!("Unknown ({})", index),
        }
    }
}
