use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::ai::EnemyDefinition;
use crate::error::{ContentDiagnostic, ContentError};
use crate::game::rewards::EncounterKind;
use crate::game::state::EnemyRank;

const EMBEDDED_ENEMIES: &str = include_str!("../../data/enemies.json");

/// 敌人注册表：按 id 与深度层索引的敌人定义。
#[derive(Debug, Clone, Default)]
pub struct EnemyRegistry {
    by_id: BTreeMap<String, EnemyDefinition>,
    by_depth: BTreeMap<u32, Vec<String>>,
}

impl EnemyRegistry {
    /// 重复 id 是致命错误；AI 权重不合法的敌人被跳过并作为诊断返回。
    pub fn build(
        definitions: Vec<EnemyDefinition>,
    ) -> Result<(Self, Vec<ContentDiagnostic>), ContentError> {
        let mut registry = Self::default();
        let mut diagnostics = Vec::new();
        for definition in definitions {
            if registry.by_id.contains_key(&definition.id) {
                return Err(ContentError::DuplicateEnemy {
                    enemy_id: definition.id,
                });
            }
            let problems = definition.validate_patterns();
            if !problems.is_empty() {
                diagnostics.extend(problems.into_iter().map(ContentDiagnostic::report));
                continue;
            }
            registry
                .by_depth
                .entry(definition.depth)
                .or_default()
                .push(definition.id.clone());
            registry.by_id.insert(definition.id.clone(), definition);
        }
        Ok((registry, diagnostics))
    }

    pub fn from_json(
        json: &str,
        source_name: &str,
    ) -> Result<(Self, Vec<ContentDiagnostic>), ContentError> {
        let definitions: Vec<EnemyDefinition> =
            serde_json::from_str(json).map_err(|error| ContentError::Malformed {
                source_name: source_name.to_string(),
                message: error.to_string(),
            })?;
        let (registry, diagnostics) = Self::build(definitions)?;
        tracing::debug!(
            source = source_name,
            enemies = registry.len(),
            skipped = diagnostics.len(),
            "enemy registry loaded"
        );
        Ok((registry, diagnostics))
    }

    pub fn get(&self, enemy_id: &str) -> Option<&EnemyDefinition> {
        self.by_id.get(enemy_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// 不超过 `depth` 的最深一层；深度低于所有层时取最浅层。
    pub fn at_depth(&self, depth: u32) -> Vec<&EnemyDefinition> {
        let tier = self
            .by_depth
            .range(..=depth)
            .next_back()
            .or_else(|| self.by_depth.iter().next())
            .map(|(_, ids)| ids.as_slice())
            .unwrap_or(&[]);
        tier.iter().filter_map(|id| self.by_id.get(id)).collect()
    }

    /// 按遭遇类型抽取敌人。Boss 遭遇取该层的首领；
    /// 其余遭遇优先普通敌人，该层没有普通敌人时改用精英。
    pub fn encounter<R: Rng + ?Sized>(
        &self,
        depth: u32,
        kind: EncounterKind,
        rng: &mut R,
    ) -> Vec<EnemyDefinition> {
        let tier = self.at_depth(depth);
        if kind == EncounterKind::Boss {
            let bosses: Vec<&EnemyDefinition> = tier
                .iter()
                .copied()
                .filter(|definition| definition.is_boss())
                .collect();
            return bosses
                .choose(rng)
                .map(|definition| vec![(*definition).clone()])
                .unwrap_or_default();
        }

        let mut pool = of_rank(&tier, EnemyRank::Normal);
        if pool.is_empty() {
            pool = of_rank(&tier, EnemyRank::Elite);
        }
        if pool.is_empty() {
            return Vec::new();
        }
        (0..kind.enemy_count())
            .filter_map(|_| pool.choose(rng).map(|definition| (*definition).clone()))
            .collect()
    }
}

fn of_rank<'a>(tier: &[&'a EnemyDefinition], rank: EnemyRank) -> Vec<&'a EnemyDefinition> {
    tier.iter()
        .copied()
        .filter(|definition| definition.rank == rank)
        .collect()
}

static DEFAULT_ENEMIES: Lazy<Arc<EnemyRegistry>> = Lazy::new(|| {
    match EnemyRegistry::from_json(EMBEDDED_ENEMIES, "data/enemies.json") {
        Ok((registry, _)) => Arc::new(registry),
        Err(error) => {
            tracing::error!(%error, "embedded enemy registry failed to load");
            Arc::new(EnemyRegistry::default())
        }
    }
});

pub fn default_enemies() -> Arc<EnemyRegistry> {
    Arc::clone(&DEFAULT_ENEMIES)
}
