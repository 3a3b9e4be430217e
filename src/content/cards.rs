use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{ContentDiagnostic, ContentError};
use crate::game::cards::{CardCatalog, CardTemplate, DerivationEntry};

const EMBEDDED_CARDS: &str = include_str!("../../data/cards.json");

/// 卡牌内容文件的结构。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardContent {
    #[serde(default)]
    pub cards: Vec<CardTemplate>,
    #[serde(default)]
    pub derivations: Vec<DerivationEntry>,
}

/// 解析卡牌内容并构建目录。`source_name` 仅用于错误信息。
pub fn load_card_catalog(
    json: &str,
    source_name: &str,
) -> Result<(CardCatalog, Vec<ContentDiagnostic>), ContentError> {
    let content: CardContent =
        serde_json::from_str(json).map_err(|error| ContentError::Malformed {
            source_name: source_name.to_string(),
            message: error.to_string(),
        })?;
    let (catalog, diagnostics) = CardCatalog::build(content.cards, content.derivations)?;
    tracing::debug!(
        source = source_name,
        templates = catalog.templates().count(),
        skipped = diagnostics.len(),
        "card catalog loaded"
    );
    Ok((catalog, diagnostics))
}

static DEFAULT_CATALOG: Lazy<Arc<CardCatalog>> = Lazy::new(|| {
    match load_card_catalog(EMBEDDED_CARDS, "data/cards.json") {
        Ok((catalog, _)) => Arc::new(catalog),
        Err(error) => {
            tracing::error!(%error, "embedded card catalog failed to load");
            Arc::new(CardCatalog::default())
        }
    }
});

/// 内置卡牌目录，进程内共享。
pub fn default_catalog() -> Arc<CardCatalog> {
    Arc::clone(&DEFAULT_CATALOG)
}
