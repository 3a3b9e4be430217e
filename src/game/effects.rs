use std::collections::BTreeSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::buffs::{BuffApplication, BuffKind};
use super::cards::{
    Card, CardCatalog, CardCategory, CardInstanceId, CardTemplate, CardTypeId, CharacterClass,
    DerivationUnlock,
};
use super::config::BattleConfig;
use super::damage::{percent_of, resolve_attack, AttackProfile, HitOutcome};
use super::deck::DeckState;
use super::equipment::EquipmentBonuses;
use super::rules::RuleError;
use super::scheduler::PhaseEntry;
use super::state::{
    BattleEvent, BattleResult, CombatantRef, EnemyBattleState, EnemyIndex, PlayerState, Resonance,
};

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EffectCondition {
    TargetHpAtMost { ratio: f64 },
    SwordEnergyAtLeast { amount: u32 },
    ResonanceAtLeast { stacks: u32 },
    Any { conditions: Vec<EffectCondition> },
    All { conditions: Vec<EffectCondition> },
}

impl EffectCondition {
    fn is_satisfied(&self, player: &PlayerState, target: Option<&EnemyBattleState>) -> bool {
        match self {
            EffectCondition::TargetHpAtMost { ratio } => target
                .map(|enemy| {
                    enemy.stats.hp as f64 / enemy.stats.max_hp.max(1) as f64 <= *ratio
                })
                .unwrap_or(false),
            EffectCondition::SwordEnergyAtLeast { amount } => player.sword_energy >= *amount,
            EffectCondition::ResonanceAtLeast { stacks } => player.resonance.stacks >= *stacks,
            EffectCondition::Any { conditions } => conditions
                .iter()
                .any(|condition| condition.is_satisfied(player, target)),
            EffectCondition::All { conditions } => conditions
                .iter()
                .all(|condition| condition.is_satisfied(player, target)),
        }
    }
}

/// 卡牌声明的效果。伤害类效果以模板的 `base_damage` 为基数。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CardEffect {
    Damage {
        #[serde(default = "one")]
        hits: u32,
    },
    Guard {
        amount: i32,
    },
    Heal {
        amount: i32,
    },
    ApplyBuff {
        buff: BuffApplication,
    },
    ApplyDebuff {
        debuff: BuffApplication,
    },
    Draw {
        count: u8,
    },
    GainEnergy {
        amount: u32,
    },
    Cleanse,
    /// 消耗全部剑气，每点追加固定伤害。
    ReleaseSwordEnergy {
        damage_per_point: i32,
    },
    Composite {
        effects: Vec<CardEffect>,
    },
    Conditional {
        condition: EffectCondition,
        effect: Box<CardEffect>,
    },
}

impl CardEffect {
    pub fn damage(hits: u32) -> Self {
        CardEffect::Damage { hits }
    }

    pub fn guard(amount: i32) -> Self {
        CardEffect::Guard { amount }
    }

    pub fn composite(effects: Vec<CardEffect>) -> Self {
        CardEffect::Composite { effects }
    }

    pub fn requires_target(&self) -> bool {
        match self {
            CardEffect::Damage { .. }
            | CardEffect::ApplyDebuff { .. }
            | CardEffect::ReleaseSwordEnergy { .. } => true,
            CardEffect::Composite { effects } => effects.iter().any(CardEffect::requires_target),
            CardEffect::Conditional { effect, .. } => effect.requires_target(),
            _ => false,
        }
    }

    fn apply<R: Rng + ?Sized>(&self, resolver: &mut Resolver<'_, R>) {
        match self {
            CardEffect::Damage { hits } => resolver.deal_damage(*hits, 0),
            CardEffect::Guard { amount } => resolver.gain_guard(*amount),
            CardEffect::Heal { amount } => resolver.heal(*amount),
            CardEffect::ApplyBuff { buff } => resolver.buff_self(*buff),
            CardEffect::ApplyDebuff { debuff } => resolver.debuff_target(*debuff),
            CardEffect::Draw { count } => resolver.draw(*count as usize),
            CardEffect::GainEnergy { amount } => {
                resolver.player.energy = resolver.player.energy.saturating_add(*amount);
                resolver.result.energy_gained += *amount;
            }
            CardEffect::Cleanse => resolver.cleanse(),
            CardEffect::ReleaseSwordEnergy { damage_per_point } => {
                let points = match resolver.player.class {
                    CharacterClass::Swordsman => resolver.player.sword_energy,
                    _ => 0,
                };
                resolver.deal_damage(1, points as i32 * damage_per_point);
                resolver.player.sword_energy = 0;
                resolver.released_sword_energy = true;
            }
            CardEffect::Composite { effects } => {
                for effect in effects {
                    effect.apply(resolver);
                }
            }
            CardEffect::Conditional { condition, effect } => {
                let target = resolver.target.and_then(|index| resolver.enemies.get(index));
                if condition.is_satisfied(&resolver.player, target) {
                    effect.apply(resolver);
                }
            }
        }
    }
}

/// 一次出牌请求。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardPlay {
    pub card_id: CardInstanceId,
    #[serde(default)]
    pub target: Option<EnemyIndex>,
}

/// 出牌时可读取的战斗状态；管线不修改它，而是返回替换值。
pub struct ExecutionContext<'a> {
    pub config: &'a BattleConfig,
    pub catalog: &'a CardCatalog,
    pub player: &'a PlayerState,
    pub enemies: &'a [EnemyBattleState],
    pub deck: &'a DeckState,
    pub unlocked: &'a BTreeSet<CardTypeId>,
    pub current_phase: Option<PhaseEntry>,
    pub result: BattleResult,
}

/// 一次出牌的不可变记录，既用于提交状态也用于界面反馈。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CardExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub card_id: CardInstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_type_id: Option<CardTypeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<CombatantRef>,
    pub energy_spent: u32,
    pub damage_dealt: i32,
    pub absorbed: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hits: Vec<HitOutcome>,
    pub critical: bool,
    pub armor_broken: bool,
    pub target_defeated: bool,
    pub guard_gained: i32,
    pub healing: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffs_applied: Vec<BuffApplication>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debuffs_applied: Vec<BuffApplication>,
    pub lifesteal: i32,
    pub reflected: i32,
    pub bleed: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cards_drawn: Vec<CardInstanceId>,
    pub energy_gained: u32,
    pub sword_energy: u32,
    pub resonance: Resonance,
    pub mastery_level: u8,
    pub mastery_increased: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unlocks: Vec<DerivationUnlock>,
}

impl CardExecutionResult {
    pub fn rejected(card_id: CardInstanceId, error: &RuleError) -> Self {
        Self {
            success: false,
            reason: Some(error.to_string()),
            card_id,
            ..Self::default()
        }
    }
}

/// 出牌管线的输出：结果记录与替换后的状态。
#[derive(Debug, Clone)]
pub struct CardExecution {
    pub result: CardExecutionResult,
    pub card: Card,
    pub player: PlayerState,
    pub enemies: Vec<EnemyBattleState>,
    pub deck: DeckState,
    pub events: Vec<BattleEvent>,
}

struct Resolver<'a, R: Rng + ?Sized> {
    config: &'a BattleConfig,
    template: &'a CardTemplate,
    card: &'a Card,
    bonuses: EquipmentBonuses,
    resonance_multiplier: f64,
    target: Option<EnemyIndex>,
    player: PlayerState,
    enemies: Vec<EnemyBattleState>,
    deck: DeckState,
    result: CardExecutionResult,
    events: Vec<BattleEvent>,
    released_sword_energy: bool,
    rng: &'a mut R,
}

impl<'a, R: Rng + ?Sized> Resolver<'a, R> {
    fn attack_profile(&self, hits: u32, extra_flat: i32) -> AttackProfile {
        let mastery = self.config.mastery_bonus(self.card.mastery_level);
        let gems = self.card.gem_level as f64 * self.config.gem_bonus_per_level;
        let sword_flat = match self.player.class {
            CharacterClass::Swordsman => {
                self.player.sword_energy as i32 * self.config.sword_energy_flat_bonus
            }
            _ => 0,
        };
        AttackProfile {
            base_damage: self.template.base_damage,
            hit_count: hits,
            element: self.template.primary_element(),
            multiplier: (1.0 + mastery + gems) * self.resonance_multiplier,
            flat_bonus: sword_flat + extra_flat,
            outgoing_percent: self.player.stats.buffs.outgoing_percent()
                + self.bonuses.damage_bonus_percent,
            crit_chance: self.config.base_crit_chance + self.bonuses.crit_chance,
            crit_multiplier: self.config.crit_multiplier + self.bonuses.crit_multiplier,
        }
    }

    fn deal_damage(&mut self, hits: u32, extra_flat: i32) {
        let Some(index) = self.target else {
            return;
        };
        let profile = self.attack_profile(hits, extra_flat);
        let target_ref = CombatantRef::Enemy { index };
        let was_alive = self.enemies[index].is_alive();
        let (stats, report) = resolve_attack(&profile, &self.enemies[index].stats, 0, &mut *self.rng);
        self.enemies[index].stats = stats;

        self.events.push(BattleEvent::DamageResolved {
            source: CombatantRef::Player,
            target: target_ref,
            ap_absorbed: report.ap_absorbed,
            guard_absorbed: report.guard_absorbed,
            hp_damage: report.hp_damage,
            critical: report.critical,
        });
        if report.broke_armor {
            self.events.push(BattleEvent::ArmorBroken { target: target_ref });
        }

        let lifesteal_percent = self.bonuses.lifesteal_percent
            + self.player.stats.buffs.value_of(BuffKind::Lifesteal);
        let stolen = percent_of(report.hp_damage, lifesteal_percent);
        if stolen > 0 {
            let (stats, restored) = self.player.stats.healed(stolen);
            self.player.stats = stats;
            self.result.lifesteal += restored;
            if restored > 0 {
                self.events.push(BattleEvent::Healed {
                    target: CombatantRef::Player,
                    amount: restored,
                });
            }
        }

        let reflect = percent_of(
            report.hp_damage,
            self.enemies[index].stats.buffs.value_of(BuffKind::Reflect),
        );
        if reflect > 0 {
            let (stats, lost) = self.player.stats.lose_hp(reflect);
            self.player.stats = stats;
            self.result.reflected += lost;
            self.events.push(BattleEvent::Reflected {
                source: target_ref,
                target: CombatantRef::Player,
                amount: lost,
            });
        }

        self.result.damage_dealt += report.hp_damage;
        self.result.absorbed += report.total_absorbed();
        self.result.critical |= report.critical;
        self.result.armor_broken |= report.broke_armor;
        self.result.hits.extend(report.hits);

        if was_alive && !self.enemies[index].is_alive() {
            self.result.target_defeated = true;
            self.events.push(BattleEvent::EnemyDefeated { index });
        }
    }

    fn gain_guard(&mut self, amount: i32) {
        if amount <= 0 {
            return;
        }
        self.player.stats = self.player.stats.with_guard(amount);
        self.result.guard_gained += amount;
        self.events.push(BattleEvent::GuardGained {
            target: CombatantRef::Player,
            amount,
        });
    }

    fn heal(&mut self, amount: i32) {
        let (stats, restored) = self.player.stats.healed(amount);
        self.player.stats = stats;
        if restored > 0 {
            self.result.healing += restored;
            self.events.push(BattleEvent::Healed {
                target: CombatantRef::Player,
                amount: restored,
            });
        }
    }

    fn buff_self(&mut self, buff: BuffApplication) {
        self.player.stats = self.player.stats.with_buffs(&[buff]);
        self.result.buffs_applied.push(buff);
        self.events.push(BattleEvent::BuffApplied {
            target: CombatantRef::Player,
            kind: buff.kind,
            stacks: buff.stacks,
            duration: buff.duration,
        });
    }

    fn debuff_target(&mut self, debuff: BuffApplication) {
        let Some(index) = self.target else {
            return;
        };
        if !self.enemies[index].is_alive() {
            return;
        }
        let enemy = &mut self.enemies[index];
        enemy.stats = enemy.stats.with_buffs(&[debuff]);
        if debuff.kind == BuffKind::Bleed {
            self.result.bleed += debuff.value;
        }
        self.result.debuffs_applied.push(debuff);
        self.events.push(BattleEvent::BuffApplied {
            target: CombatantRef::Enemy { index },
            kind: debuff.kind,
            stacks: debuff.stacks,
            duration: debuff.duration,
        });
    }

    fn draw(&mut self, count: usize) {
        let (deck, drawn, reshuffled) = self.deck.draw_into_hand(count, &mut *self.rng);
        self.deck = deck;
        if !drawn.is_empty() {
            self.events.push(BattleEvent::CardsDrawn {
                card_ids: drawn.clone(),
                reshuffled,
            });
        }
        self.result.cards_drawn.extend(drawn);
    }

    fn cleanse(&mut self) {
        self.player.stats.buffs = self.player.stats.buffs.clear_debuffs();
        self.events.push(BattleEvent::DebuffsCleared {
            target: CombatantRef::Player,
        });
    }
}

/// 元素共鸣：同元素连续出牌叠层（有上限），换元素重置为新元素 1 层；无元素卡不改变共鸣。
pub fn next_resonance(current: Resonance, template: &CardTemplate, config: &BattleConfig) -> Resonance {
    match template.primary_element() {
        None => current,
        Some(element) if current.element == Some(element) => Resonance {
            element: Some(element),
            stacks: (current.stacks + 1).min(config.resonance_max_stacks),
        },
        Some(element) => Resonance {
            element: Some(element),
            stacks: 1,
        },
    }
}

fn validate<'c>(
    play: &CardPlay,
    ctx: &'c ExecutionContext<'_>,
) -> Result<(&'c Card, &'c CardTemplate, Option<EnemyIndex>), RuleError> {
    if ctx.result.is_terminal() {
        return Err(RuleError::BattleFinished);
    }
    if !ctx.current_phase.map(|entry| entry.is_player()).unwrap_or(false) {
        return Err(RuleError::NotPlayerPhase);
    }
    let card = ctx
        .deck
        .find_in_hand(play.card_id)
        .ok_or(RuleError::CardNotFound {
            card_id: play.card_id,
        })?;
    let template = ctx
        .catalog
        .template(&card.card_type_id)
        .ok_or_else(|| RuleError::UnknownCardType {
            card_type_id: card.card_type_id.clone(),
        })?;
    if template.cost > ctx.player.energy {
        return Err(RuleError::InsufficientEnergy {
            required: template.cost,
            available: ctx.player.energy,
        });
    }

    let target = match play.target {
        Some(index) => {
            let alive = ctx
                .enemies
                .get(index)
                .map(EnemyBattleState::is_alive)
                .unwrap_or(false);
            if !alive {
                return Err(RuleError::InvalidTarget { index: Some(index) });
            }
            Some(index)
        }
        None => ctx.enemies.iter().position(EnemyBattleState::is_alive),
    };
    if template.effect.requires_target() && target.is_none() {
        return Err(RuleError::InvalidTarget { index: None });
    }
    Ok((card, template, target))
}

/// 出牌管线：校验费用与阶段归属 → 结算效果 → 职业修正 → 熟练度 → 派生解锁。
/// 校验失败时不产生任何状态变化。
pub fn execute_card<R: Rng + ?Sized>(
    play: &CardPlay,
    ctx: &ExecutionContext<'_>,
    rng: &mut R,
) -> Result<CardExecution, RuleError> {
    let (card, template, target) = validate(play, ctx)?;

    let mut player = ctx.player.clone();
    player.energy -= template.cost;
    if player.class == CharacterClass::Mage {
        player.resonance = next_resonance(player.resonance, template, ctx.config);
    }
    let resonance_multiplier = match player.class {
        CharacterClass::Mage if template.primary_element().is_some() => {
            1.0 + player.resonance.stacks as f64 * ctx.config.resonance_bonus
        }
        _ => 1.0,
    };

    let target_ref = target.map(|index| CombatantRef::Enemy { index });
    let mut resolver = Resolver {
        config: ctx.config,
        template,
        card,
        bonuses: EquipmentBonuses::aggregate(&player.equipment),
        resonance_multiplier,
        target,
        player,
        enemies: ctx.enemies.to_vec(),
        deck: ctx.deck.clone(),
        result: CardExecutionResult {
            success: true,
            card_id: card.id,
            card_type_id: Some(card.card_type_id.clone()),
            target: target_ref,
            energy_spent: template.cost,
            ..CardExecutionResult::default()
        },
        events: vec![BattleEvent::CardPlayed {
            card_id: card.id,
            card_type_id: card.card_type_id.clone(),
            target: target_ref,
        }],
        released_sword_energy: false,
        rng,
    };

    template.effect.apply(&mut resolver);

    let Resolver {
        mut player,
        enemies,
        deck,
        mut result,
        mut events,
        released_sword_energy,
        ..
    } = resolver;

    if player.class == CharacterClass::Swordsman
        && template.category == CardCategory::Attack
        && !released_sword_energy
    {
        player.sword_energy = (player.sword_energy + 1).min(ctx.config.sword_energy_max);
    }
    if template.category == CardCategory::Attack {
        player.equipment = player.equipment.iter().map(|item| item.worn(1)).collect();
    }
    result.sword_energy = player.sword_energy;
    result.resonance = player.resonance;

    let updated = card.record_use(ctx.config);
    result.mastery_level = updated.mastery_level;
    result.mastery_increased = updated.mastery_level > card.mastery_level;
    if result.mastery_increased {
        events.push(BattleEvent::MasteryIncreased {
            card_id: updated.id,
            level: updated.mastery_level,
        });
    }

    let unlocks = ctx
        .catalog
        .unlocks_for(&updated.card_type_id, updated.mastery_level, ctx.unlocked);
    for unlock in &unlocks {
        events.push(BattleEvent::DerivationUnlocked {
            unlock: unlock.clone(),
        });
    }
    result.unlocks = unlocks;

    let deck = deck.play_from_hand(&updated);

    Ok(CardExecution {
        result,
        card: updated,
        player,
        enemies,
        deck,
        events,
    })
}
