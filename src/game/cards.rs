//! 卡牌模板、卡牌实例、熟练度与派生图。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::config::BattleConfig;
use super::effects::CardEffect;
use crate::error::{ContentDiagnostic, ContentError};

/// 单张卡牌实例的唯一标识。
pub type CardInstanceId = u32;
/// 卡牌模板标识。
pub type CardTypeId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Element {
    Fire,
    Ice,
    Thunder,
    Wind,
    Earth,
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CardCategory {
    #[default]
    Attack,
    Skill,
    Power,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CharacterClass {
    Swordsman,
    Mage,
    Summoner,
}

/// 不可变的卡牌模板。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CardTemplate {
    pub card_type_id: CardTypeId,
    pub name: String,
    pub cost: u32,
    #[serde(default)]
    pub base_damage: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub category: CardCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<CharacterClass>,
    pub effect: CardEffect,
}

impl CardTemplate {
    pub fn new(
        card_type_id: impl Into<CardTypeId>,
        name: impl Into<String>,
        cost: u32,
        base_damage: i32,
        category: CardCategory,
        effect: CardEffect,
    ) -> Self {
        Self {
            card_type_id: card_type_id.into(),
            name: name.into(),
            cost,
            base_damage,
            elements: Vec::new(),
            category,
            class: None,
            effect,
        }
    }

    pub fn with_element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    pub fn primary_element(&self) -> Option<Element> {
        self.elements.first().copied()
    }
}

/// 战斗中的卡牌实例：模板 id 加上可变的使用记录。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Card {
    pub id: CardInstanceId,
    pub card_type_id: CardTypeId,
    #[serde(default)]
    pub use_count: u32,
    #[serde(default)]
    pub mastery_level: u8,
    #[serde(default)]
    pub gem_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<CardTypeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derives_into: Vec<CardTypeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_mastery_level: Option<u8>,
}

impl Card {
    pub fn new(id: CardInstanceId, card_type_id: impl Into<CardTypeId>) -> Self {
        Self {
            id,
            card_type_id: card_type_id.into(),
            use_count: 0,
            mastery_level: 0,
            gem_level: 0,
            derived_from: None,
            derives_into: Vec::new(),
            unlock_mastery_level: None,
        }
    }

    /// 使用一次后的新实例，熟练度按阈值重算。
    pub fn record_use(&self, config: &BattleConfig) -> Self {
        let use_count = self.use_count.saturating_add(1);
        Self {
            use_count,
            mastery_level: config.mastery_level(use_count),
            ..self.clone()
        }
    }
}

/// 派生关系：父卡熟练度达到要求后解锁子卡。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DerivationEntry {
    pub parent: CardTypeId,
    pub child: CardTypeId,
    pub required_mastery: u8,
}

/// 一次派生解锁。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DerivationUnlock {
    pub parent: CardTypeId,
    pub child: CardTypeId,
    pub required_mastery: u8,
}

/// 加载时解析完成的不可变派生图。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivationGraph {
    children: BTreeMap<CardTypeId, Vec<DerivationEntry>>,
    parents: BTreeMap<CardTypeId, DerivationEntry>,
}

impl DerivationGraph {
    pub fn children_of(&self, parent: &str) -> &[DerivationEntry] {
        self.children.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parent_of(&self, child: &str) -> Option<&DerivationEntry> {
        self.parents.get(child)
    }

    /// `from` 是否能沿派生边到达 `to`。
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut visited = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            for entry in self.children_of(&current) {
                stack.push(entry.child.clone());
            }
        }
        false
    }

    fn insert(&mut self, entry: DerivationEntry) {
        self.parents.insert(entry.child.clone(), entry.clone());
        self.children
            .entry(entry.parent.clone())
            .or_default()
            .push(entry);
    }
}

/// 卡牌目录：模板表与派生图。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardCatalog {
    templates: BTreeMap<CardTypeId, CardTemplate>,
    derivations: DerivationGraph,
}

impl CardCatalog {
    /// 先登记全部模板，再解析派生边；无法解析的边被拒绝并作为诊断返回。
    pub fn build(
        templates: Vec<CardTemplate>,
        derivations: Vec<DerivationEntry>,
    ) -> Result<(Self, Vec<ContentDiagnostic>), ContentError> {
        let mut by_id = BTreeMap::new();
        for template in templates {
            let card_type_id = template.card_type_id.clone();
            if by_id.insert(card_type_id.clone(), template).is_some() {
                return Err(ContentError::DuplicateCardType { card_type_id });
            }
        }

        let mut graph = DerivationGraph::default();
        let mut diagnostics = Vec::new();
        for entry in derivations {
            if let Some(diagnostic) = Self::check_derivation(&by_id, &graph, &entry) {
                diagnostics.push(diagnostic.report());
                continue;
            }
            graph.insert(entry);
        }

        Ok((
            Self {
                templates: by_id,
                derivations: graph,
            },
            diagnostics,
        ))
    }

    fn check_derivation(
        templates: &BTreeMap<CardTypeId, CardTemplate>,
        graph: &DerivationGraph,
        entry: &DerivationEntry,
    ) -> Option<ContentDiagnostic> {
        for id in [&entry.parent, &entry.child] {
            if !templates.contains_key(id) {
                return Some(ContentDiagnostic::UnknownDerivationCard {
                    parent: entry.parent.clone(),
                    child: entry.child.clone(),
                    missing: id.clone(),
                });
            }
        }
        if entry.required_mastery > BattleConfig::MAX_MASTERY_LEVEL {
            return Some(ContentDiagnostic::InvalidDerivationMastery {
                parent: entry.parent.clone(),
                child: entry.child.clone(),
                required: entry.required_mastery,
            });
        }
        if let Some(existing) = graph.parent_of(&entry.child) {
            return Some(ContentDiagnostic::DuplicateDerivationParent {
                parent: entry.parent.clone(),
                child: entry.child.clone(),
                existing_parent: existing.parent.clone(),
            });
        }
        if entry.parent == entry.child || graph.reaches(&entry.child, &entry.parent) {
            return Some(ContentDiagnostic::DerivationCycle {
                parent: entry.parent.clone(),
                child: entry.child.clone(),
            });
        }
        None
    }

    pub fn template(&self, card_type_id: &str) -> Option<&CardTemplate> {
        self.templates.get(card_type_id)
    }

    pub fn templates(&self) -> impl Iterator<Item = &CardTemplate> {
        self.templates.values()
    }

    pub fn derivations(&self) -> &DerivationGraph {
        &self.derivations
    }

    /// 生成带派生链接的新实例。
    pub fn instantiate(&self, template: &CardTemplate, id: CardInstanceId) -> Card {
        let mut card = Card::new(id, template.card_type_id.clone());
        if let Some(parent) = self.derivations.parent_of(&template.card_type_id) {
            card.derived_from = Some(parent.parent.clone());
            card.unlock_mastery_level = Some(parent.required_mastery);
        }
        card.derives_into = self
            .derivations
            .children_of(&template.card_type_id)
            .iter()
            .map(|entry| entry.child.clone())
            .collect();
        card
    }

    /// 父卡达到 `mastery_level` 时新解锁、且尚不在已解锁集合中的子卡。
    pub fn unlocks_for(
        &self,
        parent: &str,
        mastery_level: u8,
        unlocked: &BTreeSet<CardTypeId>,
    ) -> Vec<DerivationUnlock> {
        self.derivations
            .children_of(parent)
            .iter()
            .filter(|entry| mastery_level >= entry.required_mastery)
            .filter(|entry| !unlocked.contains(&entry.child))
            .map(|entry| DerivationUnlock {
                parent: entry.parent.clone(),
                child: entry.child.clone(),
                required_mastery: entry.required_mastery,
            })
            .collect()
    }

    /// 可作为战斗奖励的模板：非派生卡。
    pub fn reward_pool(&self) -> Vec<&CardTemplate> {
        self.templates
            .values()
            .filter(|template| self.derivations.parent_of(&template.card_type_id).is_none())
            .collect()
    }
}
