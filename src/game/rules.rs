use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    buffs::BuffKind,
    cards::{Card, CardCatalog, CardInstanceId, CardTypeId, CharacterClass, DerivationUnlock},
    config::BattleConfig,
    damage::{apply_hit, escape_chance, percent_of, resolve_attack, roll_escape, AttackProfile},
    deck::{create_initial_deck, CardIdAllocator, DeckState},
    effects::{execute_card, CardExecution, CardExecutionResult, CardPlay, ExecutionContext},
    equipment::{DurabilityDelta, EquipmentBonuses, EquippedItem, RawEquippedItem},
    rewards::{compute_rewards, BattleRewards},
    scheduler::{build_round_queue, PhaseEntry, PhaseQueue},
    state::{
        integrity_check, BattleEvent, BattleResult, BattleSnapshot, CombatantRef,
        CombatantSnapshot, CombatantStats, EnemyBattleState, EnemyIndex, EnemyRank,
        IntegrityError, PlayerState,
    },
};
use crate::ai::{determine_enemy_action, EnemyAction, EnemyDecision, EnemyDefinition};
use crate::error::SetupError;

/// 单次推进允许结算的最大阶段数，防止永久眩晕之类的数据让调度空转。
const MAX_PHASES_PER_STEP: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[serde(tag = "type")]
pub enum RuleError {
    #[error("the battle has already ended")]
    BattleFinished,
    #[error("it is not the player's phase")]
    NotPlayerPhase,
    #[error("card {card_id} is not in hand")]
    CardNotFound { card_id: CardInstanceId },
    #[error("card type `{card_type_id}` is not in the catalog")]
    UnknownCardType { card_type_id: CardTypeId },
    #[error("not enough energy: requires {required}, has {available}")]
    InsufficientEnergy { required: u32, available: u32 },
    #[error("invalid target {index:?}")]
    InvalidTarget { index: Option<EnemyIndex> },
    #[error("escape is not allowed in this battle")]
    EscapeForbidden,
    #[error("retry is only possible after a defeat with lives remaining")]
    RetryUnavailable,
    #[error("battle state is inconsistent: {error:?}")]
    IntegrityViolation { error: IntegrityError },
}

fn default_depth() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// 外部元进度提供的开战数据。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BattleSetup {
    pub class: CharacterClass,
    pub stats: CombatantStats,
    #[serde(default)]
    pub max_energy: Option<u32>,
    /// 按卡牌类型计数的牌组构成。
    pub deck: BTreeMap<CardTypeId, u32>,
    /// 已有的按类型累计使用次数。
    #[serde(default)]
    pub mastery: BTreeMap<CardTypeId, u32>,
    #[serde(default)]
    pub unlocked_cards: BTreeSet<CardTypeId>,
    /// 原始装备记录，开战时解析；未知技能被跳过。
    #[serde(default)]
    pub equipment: Vec<RawEquippedItem>,
    pub enemies: Vec<EnemyDefinition>,
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default = "default_true")]
    pub escape_allowed: bool,
}

/// 一次逃跑尝试的结果。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscapeAttempt {
    pub chance: f64,
    pub success: bool,
    pub result: BattleResult,
    pub events: Vec<BattleEvent>,
}

/// 战斗结束时一次性交还给元进度的结果。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BattleOutcome {
    pub result: BattleResult,
    pub rounds: u32,
    pub player_hp: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewards: Option<BattleRewards>,
    /// 本场战斗中各卡牌类型新增的使用次数。
    pub mastery_deltas: BTreeMap<CardTypeId, u32>,
    pub durability: Vec<DurabilityDelta>,
    pub unlocks: Vec<DerivationUnlock>,
}

#[derive(Debug, Clone)]
struct InitialState {
    player: PlayerState,
    enemies: Vec<EnemyBattleState>,
    deck: DeckState,
}

/// 战斗会话：持有一场战斗的全部状态，`ongoing → victory | defeat | escaped`。
#[derive(Debug, Clone)]
pub struct BattleSession {
    config: BattleConfig,
    catalog: Arc<CardCatalog>,
    setup: BattleSetup,
    initial: InitialState,
    player: PlayerState,
    enemies: Vec<EnemyBattleState>,
    deck: DeckState,
    queue: PhaseQueue,
    result: BattleResult,
    phase_open: bool,
    unlocked: BTreeSet<CardTypeId>,
    unlocks: Vec<DerivationUnlock>,
    card_uses: BTreeMap<CardTypeId, u32>,
    rewards: Option<BattleRewards>,
    last_execution: Option<CardExecutionResult>,
    events: Vec<BattleEvent>,
    pending: Vec<BattleEvent>,
    rng: SmallRng,
}

impl BattleSession {
    pub fn new(
        mut setup: BattleSetup,
        catalog: Arc<CardCatalog>,
        config: BattleConfig,
        mut rng: SmallRng,
    ) -> Result<Self, SetupError> {
        setup.enemies.retain(|definition| {
            let problems = definition.validate_patterns();
            let valid = problems.is_empty();
            for problem in problems {
                problem.report();
            }
            valid
        });
        if setup.enemies.is_empty() {
            return Err(SetupError::NoEnemies);
        }
        if setup.stats.max_hp <= 0 {
            return Err(SetupError::InvalidPlayerStats {
                max_hp: setup.stats.max_hp,
            });
        }

        let mut ids = CardIdAllocator::new();
        let cards = create_initial_deck(&setup.deck, &catalog, &mut ids, &mut rng)
            .into_iter()
            .map(|card| with_stored_mastery(card, &setup.mastery, &config))
            .collect();

        let mut stats = setup.stats.clone();
        stats.hp = stats.hp.clamp(0, stats.max_hp);
        stats.max_ap = stats.max_ap.max(0);
        stats.ap = stats.ap.clamp(0, stats.max_ap);
        stats.guard = stats.guard.max(0);
        let max_energy = setup.max_energy.unwrap_or(config.player_max_energy);
        let equipment = setup
            .equipment
            .iter()
            .cloned()
            .map(|raw| EquippedItem::from_raw(raw).0)
            .collect();
        let player = PlayerState::new(stats, setup.class, max_energy).with_equipment(equipment);
        let enemies: Vec<EnemyBattleState> = setup
            .enemies
            .iter()
            .map(EnemyBattleState::from_definition)
            .collect();
        let initial = InitialState {
            player,
            enemies,
            deck: DeckState::new(cards),
        };

        let mut session = Self {
            queue: PhaseQueue::new(Vec::new()),
            player: initial.player.clone(),
            enemies: initial.enemies.clone(),
            deck: initial.deck.clone(),
            unlocked: setup.unlocked_cards.clone(),
            initial,
            setup,
            config,
            catalog,
            result: BattleResult::Ongoing,
            phase_open: false,
            unlocks: Vec::new(),
            card_uses: BTreeMap::new(),
            rewards: None,
            last_execution: None,
            events: Vec::new(),
            pending: Vec::new(),
            rng,
        };
        info!(
            enemies = session.enemies.len(),
            depth = session.setup.depth,
            cards = session.deck.total_cards(),
            "battle started"
        );
        session.begin_battle();
        Ok(session)
    }

    pub fn with_seed(
        setup: BattleSetup,
        catalog: Arc<CardCatalog>,
        config: BattleConfig,
        seed: u64,
    ) -> Result<Self, SetupError> {
        Self::new(setup, catalog, config, SmallRng::seed_from_u64(seed))
    }

    pub fn from_entropy(
        setup: BattleSetup,
        catalog: Arc<CardCatalog>,
        config: BattleConfig,
    ) -> Result<Self, SetupError> {
        Self::new(setup, catalog, config, SmallRng::from_entropy())
    }

    fn begin_battle(&mut self) -> Vec<BattleEvent> {
        self.queue = PhaseQueue::new(build_round_queue(
            self.player.stats.effective_speed(),
            &self.enemies,
        ));
        self.push(BattleEvent::RoundStarted {
            round: self.queue.round,
        });
        self.run_until_player_input();
        self.flush()
    }

    pub fn config(&self) -> &BattleConfig {
        &self.config
    }

    pub fn result(&self) -> BattleResult {
        self.result
    }

    pub fn player(&self) -> &PlayerState {
        &self.player
    }

    pub fn enemies(&self) -> &[EnemyBattleState] {
        &self.enemies
    }

    pub fn deck(&self) -> &DeckState {
        &self.deck
    }

    pub fn queue(&self) -> &PhaseQueue {
        &self.queue
    }

    /// 完整事件日志。
    pub fn events(&self) -> &[BattleEvent] {
        &self.events
    }

    pub fn is_player_phase(&self) -> bool {
        self.phase_open && !self.result.is_terminal()
    }

    pub fn last_execution(&self) -> Option<&CardExecutionResult> {
        self.last_execution.as_ref()
    }

    fn push(&mut self, event: BattleEvent) {
        self.pending.push(event);
    }

    fn flush(&mut self) -> Vec<BattleEvent> {
        let events = std::mem::take(&mut self.pending);
        self.events.extend(events.iter().cloned());
        events
    }

    fn ensure_player_phase(&self) -> Result<(), RuleError> {
        if self.result.is_terminal() {
            return Err(RuleError::BattleFinished);
        }
        if !self.phase_open {
            return Err(RuleError::NotPlayerPhase);
        }
        Ok(())
    }

    fn ensure_integrity(&self) -> Result<(), RuleError> {
        if self.queue.current_phase_index >= self.queue.len() {
            return Err(RuleError::IntegrityViolation {
                error: IntegrityError::PhaseCursorOutOfRange {
                    cursor: self.queue.current_phase_index,
                    len: self.queue.len(),
                },
            });
        }
        integrity_check(
            &self.player,
            &self.enemies,
            self.deck.all_cards().map(|card| &card.id),
        )
        .map_err(|error| RuleError::IntegrityViolation { error })
    }

    /// 出牌。失败不抛出，而是返回 `success: false` 的结果且不改变状态。
    pub fn play_card(&mut self, play: CardPlay) -> CardExecutionResult {
        let result = match self.try_play_card(play) {
            Ok(result) => result,
            Err(error) => {
                debug!(card_id = play.card_id, %error, "card play rejected");
                CardExecutionResult::rejected(play.card_id, &error)
            }
        };
        self.last_execution = Some(result.clone());
        self.flush();
        result
    }

    fn try_play_card(&mut self, play: CardPlay) -> Result<CardExecutionResult, RuleError> {
        self.ensure_player_phase()?;
        self.ensure_integrity()?;

        let ctx = ExecutionContext {
            config: &self.config,
            catalog: self.catalog.as_ref(),
            player: &self.player,
            enemies: &self.enemies,
            deck: &self.deck,
            unlocked: &self.unlocked,
            current_phase: self.queue.current(),
            result: self.result,
        };
        let CardExecution {
            result,
            card,
            player,
            enemies,
            deck,
            events,
        } = execute_card(&play, &ctx, &mut self.rng)?;

        self.player = player;
        self.enemies = enemies;
        self.deck = deck;
        self.pending.extend(events);
        *self.card_uses.entry(card.card_type_id.clone()).or_default() += 1;
        for unlock in &result.unlocks {
            info!(parent = %unlock.parent, child = %unlock.child, "derivation unlocked");
            self.unlocked.insert(unlock.child.clone());
            self.unlocks.push(unlock.clone());
        }
        debug!(
            card_id = card.id,
            card_type = %card.card_type_id,
            damage = result.damage_dealt,
            critical = result.critical,
            "card resolved"
        );

        self.evaluate_result();
        Ok(result)
    }

    /// 结束玩家阶段：弃掉手牌、结算持续时间，然后推进到下一个玩家阶段或战斗结束。
    pub fn end_player_phase(&mut self) -> Result<Vec<BattleEvent>, RuleError> {
        self.ensure_player_phase()?;
        self.close_player_phase();
        self.advance_cursor();
        self.run_until_player_input();
        Ok(self.flush())
    }

    /// 逃跑：仅限玩家阶段且非首领战。失败则结束玩家阶段。
    pub fn attempt_escape(&mut self) -> Result<EscapeAttempt, RuleError> {
        self.ensure_player_phase()?;
        let boss_battle = self
            .enemies
            .iter()
            .any(|enemy| enemy.rank == EnemyRank::Boss);
        if boss_battle || !self.setup.escape_allowed {
            return Err(RuleError::EscapeForbidden);
        }

        let opposing = self
            .enemies
            .iter()
            .filter(|enemy| enemy.is_alive())
            .map(|enemy| enemy.stats.effective_speed())
            .max()
            .unwrap_or(0);
        let chance = escape_chance(self.player.stats.effective_speed(), opposing, &self.config);
        let success = roll_escape(chance, &mut self.rng);
        debug!(chance, success, "escape attempted");
        self.push(BattleEvent::EscapeAttempted { chance, success });

        if success {
            self.conclude(BattleResult::Escaped);
        } else {
            self.close_player_phase();
            self.advance_cursor();
            self.run_until_player_input();
        }

        Ok(EscapeAttempt {
            chance,
            success,
            result: self.result,
            events: self.flush(),
        })
    }

    /// 预览敌人下一次行动。使用克隆的随机数发生器，不改变会话状态。
    pub fn preview_enemy_action(&self, index: EnemyIndex) -> Result<EnemyDecision, RuleError> {
        let enemy = self
            .enemies
            .get(index)
            .filter(|enemy| enemy.is_alive())
            .ok_or(RuleError::InvalidTarget { index: Some(index) })?;
        let definition = self
            .setup
            .enemies
            .get(index)
            .ok_or(RuleError::InvalidTarget { index: Some(index) })?;
        let mut rng = self.rng.clone();
        Ok(determine_enemy_action(
            definition,
            enemy.stats.hp,
            enemy.stats.max_hp,
            enemy.turn_count + 1,
            &mut rng,
        ))
    }

    /// 战败且仍有生命时，把战斗重置为初始状态。
    pub fn retry(&mut self, lives_remaining: u32) -> Result<Vec<BattleEvent>, RuleError> {
        if self.result != BattleResult::Defeat || lives_remaining == 0 {
            return Err(RuleError::RetryUnavailable);
        }
        info!(lives_remaining, "battle retried");

        self.player = self.initial.player.clone();
        self.enemies = self.initial.enemies.clone();
        self.deck = self.initial.deck.clone();
        self.result = BattleResult::Ongoing;
        self.phase_open = false;
        self.unlocked = self.setup.unlocked_cards.clone();
        self.unlocks.clear();
        self.card_uses.clear();
        self.rewards = None;
        self.last_execution = None;
        self.events.clear();
        self.pending.clear();
        Ok(self.begin_battle())
    }

    /// 交还给元进度的结果：熟练度增量、耐久增量、解锁与奖励。
    pub fn finish(&self) -> BattleOutcome {
        let durability = self
            .initial
            .player
            .equipment
            .iter()
            .zip(&self.player.equipment)
            .filter(|(before, after)| before.durability != after.durability)
            .map(|(before, after)| DurabilityDelta {
                item_id: after.id.clone(),
                lost: before.durability.saturating_sub(after.durability),
                remaining: after.durability,
            })
            .collect();

        BattleOutcome {
            result: self.result,
            rounds: self.queue.round,
            player_hp: self.player.stats.hp,
            rewards: self.rewards.clone(),
            mastery_deltas: self.card_uses.clone(),
            durability,
            unlocks: self.unlocks.clone(),
        }
    }

    pub fn snapshot(&self) -> BattleSnapshot {
        BattleSnapshot {
            result: self.result,
            round: self.queue.round,
            player: CombatantSnapshot::of_player(&self.player),
            sword_energy: self.player.sword_energy,
            resonance: self.player.resonance,
            enemies: self
                .enemies
                .iter()
                .enumerate()
                .map(|(index, enemy)| CombatantSnapshot::of_enemy(index, enemy))
                .collect(),
            phase_queue: self.queue.entries.clone(),
            current_phase_index: self.queue.current_phase_index,
            hand: self.deck.hand.iter().map(|card| card.id).collect(),
            draw_pile_count: self.deck.draw_pile.len(),
            discard_pile_count: self.deck.discard_pile.len(),
            last_execution: self.last_execution.clone(),
        }
    }

    fn run_until_player_input(&mut self) {
        let mut resolved = 0;
        while !self.result.is_terminal() && !self.phase_open {
            if resolved >= MAX_PHASES_PER_STEP {
                warn!(round = self.queue.round, "phase limit reached, forcing player phase");
                self.open_player_phase();
                return;
            }
            resolved += 1;

            let Some(entry) = self.queue.current() else {
                return;
            };
            match entry.enemy_index {
                Some(index) => self.run_enemy_phase(entry, index),
                None => {
                    if self.begin_player_phase(entry) {
                        return;
                    }
                }
            }
            if !self.result.is_terminal() {
                self.advance_cursor();
            }
        }
    }

    fn advance_cursor(&mut self) {
        if self.queue.advance() {
            let entries = build_round_queue(self.player.stats.effective_speed(), &self.enemies);
            self.queue.start_round(entries);
            debug!(round = self.queue.round, phases = self.queue.len(), "round started");
            self.push(BattleEvent::RoundStarted {
                round: self.queue.round,
            });
        }
    }

    fn begin_player_phase(&mut self, entry: PhaseEntry) -> bool {
        debug!(round = self.queue.round, "player phase");
        self.push(BattleEvent::PhaseStarted { entry });
        self.player.stats.guard = 0;
        self.apply_upkeep(CombatantRef::Player);
        if self.evaluate_result() {
            return false;
        }
        if self.player.stats.buffs.has(BuffKind::Stun) {
            self.push(BattleEvent::PhaseSkipped {
                entry,
                reason: "stunned".to_string(),
            });
            self.tick_buffs(CombatantRef::Player);
            return false;
        }
        self.open_player_phase();
        true
    }

    fn open_player_phase(&mut self) {
        self.player.energy = self.player.max_energy;
        let (deck, drawn, reshuffled) = self
            .deck
            .draw_into_hand(self.config.hand_size as usize, &mut self.rng);
        self.deck = deck;
        self.push(BattleEvent::CardsDrawn {
            card_ids: drawn,
            reshuffled,
        });
        self.phase_open = true;
    }

    fn close_player_phase(&mut self) {
        let count = self.deck.hand.len();
        self.deck = self.deck.discard_hand();
        self.push(BattleEvent::HandDiscarded { count });
        self.tick_buffs(CombatantRef::Player);
        self.phase_open = false;
    }

    fn run_enemy_phase(&mut self, entry: PhaseEntry, index: EnemyIndex) {
        let alive = self
            .enemies
            .get(index)
            .map(EnemyBattleState::is_alive)
            .unwrap_or(false);
        if !alive {
            self.push(BattleEvent::PhaseSkipped {
                entry,
                reason: "defeated".to_string(),
            });
            return;
        }

        debug!(round = self.queue.round, enemy = index, "enemy phase");
        self.push(BattleEvent::PhaseStarted { entry });
        let target = CombatantRef::Enemy { index };
        {
            let enemy = &mut self.enemies[index];
            enemy.stats.guard = 0;
            enemy.phase_count += 1;
        }
        self.apply_upkeep(target);
        if self.evaluate_result() || !self.enemies[index].is_alive() {
            return;
        }
        if self.enemies[index].stats.buffs.has(BuffKind::Stun) {
            self.push(BattleEvent::PhaseSkipped {
                entry,
                reason: "stunned".to_string(),
            });
            self.tick_buffs(target);
            return;
        }

        self.enemies[index].energy = self.enemies[index].max_energy;
        let mut acted = false;
        while self.enemies[index].energy > 0
            && self.enemies[index].is_alive()
            && !self.result.is_terminal()
        {
            let enemy = &mut self.enemies[index];
            let turn = enemy.turn_count + 1;
            let decision = determine_enemy_action(
                &self.setup.enemies[index],
                enemy.stats.hp,
                enemy.stats.max_hp,
                turn,
                &mut self.rng,
            );
            // 首次行动总会执行；之后能量不足以支付所选行动时结束阶段。
            let cost = decision.action.energy_cost.max(1);
            if acted && cost > enemy.energy {
                break;
            }
            enemy.turn_count = turn;
            enemy.energy = enemy.energy.saturating_sub(cost);
            acted = true;
            self.resolve_enemy_action(index, &decision.action);
            self.evaluate_result();
        }
        self.tick_buffs(target);
    }

    fn resolve_enemy_action(&mut self, index: EnemyIndex, action: &EnemyAction) {
        let source = CombatantRef::Enemy { index };
        debug!(enemy = index, action = %action.name, "enemy acted");
        self.push(BattleEvent::EnemyActed {
            index,
            action: action.name.clone(),
        });

        if action.guard_gain > 0 {
            self.enemies[index].stats = self.enemies[index].stats.with_guard(action.guard_gain);
            self.push(BattleEvent::GuardGained {
                target: source,
                amount: action.guard_gain,
            });
        }
        if action.heal > 0 {
            let (stats, restored) = self.enemies[index].stats.healed(action.heal);
            self.enemies[index].stats = stats;
            if restored > 0 {
                self.push(BattleEvent::Healed {
                    target: source,
                    amount: restored,
                });
            }
        }
        if !action.buffs.is_empty() {
            self.enemies[index].stats = self.enemies[index].stats.with_buffs(&action.buffs);
            for buff in &action.buffs {
                self.push(BattleEvent::BuffApplied {
                    target: source,
                    kind: buff.kind,
                    stacks: buff.stacks,
                    duration: buff.duration,
                });
            }
        }

        if action.is_attack() {
            self.enemy_attack(index, action);
        }

        if !action.debuffs.is_empty() && !self.player.stats.is_defeated() {
            self.player.stats = self.player.stats.with_buffs(&action.debuffs);
            for debuff in &action.debuffs {
                self.push(BattleEvent::BuffApplied {
                    target: CombatantRef::Player,
                    kind: debuff.kind,
                    stacks: debuff.stacks,
                    duration: debuff.duration,
                });
            }
        }
    }

    fn enemy_attack(&mut self, index: EnemyIndex, action: &EnemyAction) {
        let source = CombatantRef::Enemy { index };
        let bonuses = EquipmentBonuses::aggregate(&self.player.equipment);
        let mut profile = AttackProfile::new(action.damage, action.hit_count);
        profile.element = action.element;
        profile.outgoing_percent = self.enemies[index].stats.buffs.outgoing_percent();

        let (stats, report) = resolve_attack(
            &profile,
            &self.player.stats,
            bonuses.damage_reduction_percent,
            &mut self.rng,
        );
        self.player.stats = stats;
        self.push(BattleEvent::DamageResolved {
            source,
            target: CombatantRef::Player,
            ap_absorbed: report.ap_absorbed,
            guard_absorbed: report.guard_absorbed,
            hp_damage: report.hp_damage,
            critical: report.critical,
        });
        if report.broke_armor {
            self.push(BattleEvent::ArmorBroken {
                target: CombatantRef::Player,
            });
        }

        let stolen = percent_of(
            report.hp_damage,
            self.enemies[index].stats.buffs.value_of(BuffKind::Lifesteal),
        );
        if stolen > 0 {
            let (stats, restored) = self.enemies[index].stats.healed(stolen);
            self.enemies[index].stats = stats;
            if restored > 0 {
                self.push(BattleEvent::Healed {
                    target: source,
                    amount: restored,
                });
            }
        }

        let reflect = percent_of(
            report.hp_damage,
            self.player.stats.buffs.value_of(BuffKind::Reflect),
        );
        if reflect > 0 {
            let (stats, lost) = self.enemies[index].stats.lose_hp(reflect);
            self.enemies[index].stats = stats;
            self.push(BattleEvent::Reflected {
                source: CombatantRef::Player,
                target: source,
                amount: lost,
            });
        }

        if bonuses.counter_damage > 0
            && !report.hits.is_empty()
            && !self.player.stats.is_defeated()
            && self.enemies[index].is_alive()
        {
            let (stats, hit) = apply_hit(&self.enemies[index].stats, bonuses.counter_damage);
            self.enemies[index].stats = stats;
            self.push(BattleEvent::DamageResolved {
                source: CombatantRef::Player,
                target: source,
                ap_absorbed: hit.ap_absorbed,
                guard_absorbed: hit.guard_absorbed,
                hp_damage: hit.hp_damage,
                critical: false,
            });
        }

        if !self.enemies[index].is_alive() {
            self.push(BattleEvent::EnemyDefeated { index });
        }
    }

    fn stats_of(&self, target: CombatantRef) -> Option<&CombatantStats> {
        match target {
            CombatantRef::Player => Some(&self.player.stats),
            CombatantRef::Enemy { index } => self.enemies.get(index).map(|enemy| &enemy.stats),
        }
    }

    fn replace_stats(&mut self, target: CombatantRef, stats: CombatantStats) {
        match target {
            CombatantRef::Player => self.player.stats = stats,
            CombatantRef::Enemy { index } => {
                if let Some(enemy) = self.enemies.get_mut(index) {
                    enemy.stats = stats;
                }
            }
        }
    }

    /// 阶段开始：持续伤害（无视 AP 与格挡）与再生。
    fn apply_upkeep(&mut self, target: CombatantRef) {
        let Some(stats) = self.stats_of(target).cloned() else {
            return;
        };
        let dot = stats.buffs.damage_over_time();
        let regen = stats.buffs.value_of(BuffKind::Regen);

        let (stats, lost) = stats.lose_hp(dot);
        let (stats, restored) = stats.healed(regen);
        let defeated = stats.is_defeated();
        self.replace_stats(target, stats);

        if lost > 0 {
            self.push(BattleEvent::DamageOverTime {
                target,
                amount: lost,
            });
        }
        if restored > 0 {
            self.push(BattleEvent::Healed {
                target,
                amount: restored,
            });
        }
        if let (CombatantRef::Enemy { index }, true, true) = (target, defeated, lost > 0) {
            self.push(BattleEvent::EnemyDefeated { index });
        }
    }

    /// 阶段结束：增减益持续时间减一。
    fn tick_buffs(&mut self, target: CombatantRef) {
        let Some(stats) = self.stats_of(target).cloned() else {
            return;
        };
        let (buffs, expired) = stats.buffs.tick_durations();
        self.replace_stats(target, CombatantStats { buffs, ..stats });
        for kind in expired {
            self.push(BattleEvent::BuffExpired { target, kind });
        }
    }

    /// 每次结算后检查终局；同一步内双方同时倒下时判负优先。
    fn evaluate_result(&mut self) -> bool {
        if self.result.is_terminal() {
            return true;
        }
        let result = if self.player.stats.is_defeated() {
            BattleResult::Defeat
        } else if self.enemies.iter().all(|enemy| !enemy.is_alive()) {
            BattleResult::Victory
        } else {
            return false;
        };
        self.conclude(result);
        true
    }

    fn conclude(&mut self, result: BattleResult) {
        self.result = result;
        self.phase_open = false;
        if result == BattleResult::Victory {
            let total_mastery = self
                .deck
                .all_cards()
                .map(|card| card.mastery_level as u32)
                .sum();
            self.rewards = Some(compute_rewards(
                &self.enemies,
                self.setup.depth,
                total_mastery,
                &self.unlocks,
                &self.catalog,
                &self.config,
                &mut self.rng,
            ));
        }
        info!(?result, round = self.queue.round, "battle ended");
        self.push(BattleEvent::BattleEnded { result });
    }
}

fn with_stored_mastery(
    mut card: Card,
    store: &BTreeMap<CardTypeId, u32>,
    config: &BattleConfig,
) -> Card {
    if let Some(uses) = store.get(&card.card_type_id) {
        card.use_count = *uses;
        card.mastery_level = config.mastery_level(*uses);
    }
    card
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiPattern, EnemyAction};
    use crate::game::buffs::BuffApplication;
    use crate::game::cards::{CardCategory, CardTemplate};
    use crate::game::effects::CardEffect;
    use crate::game::equipment::RawEquipmentSkill;
    use crate::game::rewards::EncounterKind;

    fn catalog() -> Arc<CardCatalog> {
        let templates = vec![
            CardTemplate::new("strike", "Strike", 1, 10, CardCategory::Attack, CardEffect::damage(1)),
            CardTemplate::new("cleave", "Cleave", 1, 70, CardCategory::Attack, CardEffect::damage(1)),
            CardTemplate::new("brace", "Brace", 1, 0, CardCategory::Skill, CardEffect::guard(5)),
        ];
        Arc::new(CardCatalog::build(templates, Vec::new()).expect("catalog should build").0)
    }

    fn config() -> BattleConfig {
        BattleConfig {
            base_crit_chance: 0.0,
            ..BattleConfig::default()
        }
    }

    fn definition(id: &str, rank: EnemyRank, hp: i32, speed: i32) -> EnemyDefinition {
        EnemyDefinition {
            id: id.into(),
            name: id.into(),
            rank,
            depth: 1,
            max_hp: hp,
            max_ap: 0,
            speed,
            attack: 7,
            energy: 1,
            ai_patterns: Vec::new(),
        }
    }

    fn setup(deck: &[(&str, u32)], enemies: Vec<EnemyDefinition>) -> BattleSetup {
        BattleSetup {
            class: CharacterClass::Summoner,
            stats: CombatantStats::new(100, 30, 8),
            max_energy: None,
            deck: deck.iter().map(|(id, count)| (id.to_string(), *count)).collect(),
            mastery: BTreeMap::new(),
            unlocked_cards: BTreeSet::new(),
            equipment: Vec::new(),
            enemies,
            depth: 1,
            escape_allowed: true,
        }
    }

    fn raw_item(id: &str, skills: &[(&str, f64)]) -> RawEquippedItem {
        RawEquippedItem {
            id: id.into(),
            name: id.into(),
            level: 1,
            durability: 10,
            max_durability: 10,
            skills: skills
                .iter()
                .map(|(effect_type, value)| RawEquipmentSkill {
                    effect_type: effect_type.to_string(),
                    value: *value,
                    required_level: 1,
                })
                .collect(),
        }
    }

    fn session(setup: BattleSetup) -> BattleSession {
        BattleSession::with_seed(setup, catalog(), config(), 7).expect("session should start")
    }

    fn first_in_hand(session: &BattleSession, card_type: &str) -> CardInstanceId {
        session
            .deck()
            .hand
            .iter()
            .find(|card| card.card_type_id == card_type)
            .map(|card| card.id)
            .expect("card type should be in hand")
    }

    #[test]
    fn setup_without_enemies_is_rejected() {
        let result = BattleSession::with_seed(setup(&[("strike", 5)], Vec::new()), catalog(), config(), 1);
        assert_eq!(result.err(), Some(SetupError::NoEnemies));
    }

    #[test]
    fn faster_player_opens_with_a_full_hand() {
        let session = session(setup(
            &[("strike", 8)],
            vec![definition("slime", EnemyRank::Normal, 65, 5)],
        ));
        assert!(session.is_player_phase());
        assert_eq!(session.deck().hand.len(), 5);
        assert_eq!(session.player().energy, 3);
        assert_eq!(session.queue().current(), Some(PhaseEntry::player()));
    }

    #[test]
    fn lethal_card_ends_battle_with_single_rewards() {
        let mut session = session(setup(
            &[("cleave", 5)],
            vec![definition("slime", EnemyRank::Normal, 65, 5)],
        ));
        let card_id = first_in_hand(&session, "cleave");
        let result = session.play_card(CardPlay {
            card_id,
            target: Some(0),
        });
        assert!(result.success);
        assert_eq!(result.damage_dealt, 65);
        assert!(result.target_defeated);
        assert_eq!(session.enemies()[0].stats.hp, 0);
        assert_eq!(session.result(), BattleResult::Victory);

        let outcome = session.finish();
        let rewards = outcome.rewards.expect("victory should compute rewards");
        assert_eq!(rewards.encounter, EncounterKind::Single);
        assert_eq!(rewards.souls_gained, 10);
        assert_eq!(outcome.mastery_deltas.get("cleave"), Some(&1));
        assert!(matches!(
            session.events().last(),
            Some(BattleEvent::BattleEnded {
                result: BattleResult::Victory
            })
        ));

        let again = session.play_card(CardPlay {
            card_id: first_in_hand(&session, "cleave"),
            target: Some(0),
        });
        assert!(!again.success);
    }

    #[test]
    fn invalid_play_is_a_no_op() {
        let mut session = session(setup(
            &[("strike", 5)],
            vec![definition("slime", EnemyRank::Normal, 65, 5)],
        ));
        let before = session.snapshot();
        let result = session.play_card(CardPlay {
            card_id: 999,
            target: Some(0),
        });
        assert!(!result.success);
        assert!(result.reason.is_some());
        let mut after = session.snapshot();
        after.last_execution = None;
        assert_eq!(before, after);
    }

    #[test]
    fn simultaneous_knockout_resolves_to_defeat() {
        let mut setup = setup(
            &[("strike", 5)],
            vec![definition("thorn", EnemyRank::Normal, 10, 5)],
        );
        setup.stats.hp = 5;
        setup.stats.ap = 0;
        let mut session = session(setup);
        session.enemies[0].stats = session.enemies[0]
            .stats
            .with_buffs(&[BuffApplication::new(BuffKind::Reflect, 3, 100)]);

        let card_id = first_in_hand(&session, "strike");
        let result = session.play_card(CardPlay {
            card_id,
            target: Some(0),
        });
        assert!(result.target_defeated);
        assert_eq!(result.reflected, 5);
        assert_eq!(session.result(), BattleResult::Defeat);
        assert!(session.finish().rewards.is_none());
    }

    #[test]
    fn ending_the_phase_runs_enemy_turn_and_starts_next_round() {
        let mut session = session(setup(
            &[("strike", 6)],
            vec![definition("slime", EnemyRank::Normal, 65, 5)],
        ));
        let card_id = first_in_hand(&session, "strike");
        session.play_card(CardPlay {
            card_id,
            target: Some(0),
        });
        assert_eq!(session.player().energy, 2);

        let events = session.end_player_phase().expect("phase should end");
        assert!(events
            .iter()
            .any(|event| matches!(event, BattleEvent::EnemyActed { index: 0, .. })));
        assert!(events
            .iter()
            .any(|event| matches!(event, BattleEvent::RoundStarted { round: 2 })));
        assert_eq!(session.player().stats.ap, 23);
        assert_eq!(session.player().energy, 3);
        assert_eq!(session.deck().hand.len(), 5);
        assert_eq!(session.deck().total_cards(), 6);
        assert_eq!(session.enemies()[0].turn_count, 1);
        assert_eq!(session.enemies()[0].phase_count, 1);
        assert!(session.is_player_phase());
    }

    #[test]
    fn faster_enemy_acts_before_the_first_player_phase() {
        let session = session(setup(
            &[("strike", 5)],
            vec![definition("hound", EnemyRank::Normal, 40, 15)],
        ));
        assert_eq!(session.enemies()[0].turn_count, 1);
        assert_eq!(session.player().stats.ap, 23);
        assert!(session.is_player_phase());
    }

    #[test]
    fn stunned_player_loses_a_phase() {
        let mut session = session(setup(
            &[("strike", 5)],
            vec![definition("slime", EnemyRank::Normal, 65, 5)],
        ));
        session.player.stats = session
            .player
            .stats
            .with_buffs(&[BuffApplication::new(BuffKind::Stun, 2, 0)]);

        let events = session.end_player_phase().expect("phase should end");
        assert!(events.iter().any(|event| matches!(
            event,
            BattleEvent::PhaseSkipped { reason, .. } if reason == "stunned"
        )));
        assert_eq!(session.enemies()[0].turn_count, 2);
        assert!(!session.player().stats.buffs.has(BuffKind::Stun));
        assert!(session.is_player_phase());
    }

    #[test]
    fn multi_enemy_round_gives_each_enemy_a_phase() {
        let mut session = session(setup(
            &[("strike", 5)],
            vec![
                definition("a", EnemyRank::Normal, 20, 4),
                definition("b", EnemyRank::Normal, 20, 6),
                definition("c", EnemyRank::Normal, 20, 3),
            ],
        ));
        assert_eq!(session.queue().len(), 4);
        session.end_player_phase().expect("phase should end");
        for enemy in session.enemies() {
            assert_eq!(enemy.turn_count, 1);
        }
        assert_eq!(session.player().stats.ap, 30 - 21);
    }

    #[test]
    fn rotation_patterns_drive_enemy_actions() {
        let mut definition = definition("golem", EnemyRank::Elite, 80, 5);
        definition.ai_patterns = vec![
            AiPattern::rotation(1, EnemyAction::defend("Harden", 10)),
            AiPattern::rotation(2, EnemyAction::attack("Slam", 12, 1)),
        ];
        let mut session = session(setup(&[("strike", 5)], vec![definition]));

        let preview = session.preview_enemy_action(0).expect("preview");
        assert_eq!(preview.action.name, "Harden");
        let events = session.end_player_phase().expect("phase should end");
        assert!(events.iter().any(|event| matches!(
            event,
            BattleEvent::EnemyActed { action, .. } if action == "Harden"
        )));
        assert_eq!(
            session.preview_enemy_action(0).expect("preview").action.name,
            "Slam"
        );
    }

    #[test]
    fn preview_does_not_change_state() {
        let mut definition = definition("imp", EnemyRank::Normal, 30, 5);
        definition.ai_patterns = vec![
            AiPattern::weighted(0.5, EnemyAction::attack("Claw", 5, 1)),
            AiPattern::weighted(0.5, EnemyAction::attack("Bite", 6, 1)),
        ];
        let session = session(setup(&[("strike", 5)], vec![definition]));
        let before = session.snapshot();
        let first = session.preview_enemy_action(0).expect("preview");
        let second = session.preview_enemy_action(0).expect("preview");
        assert_eq!(first, second);
        assert_eq!(before, session.snapshot());
        assert!(session.preview_enemy_action(3).is_err());
    }

    #[test]
    fn escape_is_forbidden_against_bosses() {
        let mut session = session(setup(
            &[("strike", 5)],
            vec![definition("lich", EnemyRank::Boss, 300, 5)],
        ));
        assert_eq!(session.attempt_escape().err(), Some(RuleError::EscapeForbidden));
    }

    #[test]
    fn escape_either_ends_battle_or_ends_the_phase() {
        let mut successes = 0;
        for seed in 0..40 {
            let mut setup = setup(
                &[("strike", 5)],
                vec![definition("slime", EnemyRank::Normal, 65, 10)],
            );
            setup.stats.speed = 10;
            let mut session =
                BattleSession::with_seed(setup, catalog(), config(), seed).expect("session");
            let attempt = session.attempt_escape().expect("escape allowed");
            assert!((attempt.chance - 0.4).abs() < 1e-9);
            if attempt.success {
                successes += 1;
                assert_eq!(session.result(), BattleResult::Escaped);
                assert!(session.finish().rewards.is_none());
            } else {
                assert_eq!(session.result(), BattleResult::Ongoing);
                assert_eq!(session.enemies()[0].turn_count, 1);
                assert!(session.is_player_phase());
            }
        }
        assert!(successes > 0 && successes < 40);
    }

    #[test]
    fn retry_restores_the_initial_state() {
        let mut setup = setup(
            &[("strike", 5)],
            vec![definition("ogre", EnemyRank::Normal, 65, 5)],
        );
        setup.stats.hp = 5;
        setup.stats.ap = 0;
        let mut session = session(setup);
        assert_eq!(session.retry(3).err(), Some(RuleError::RetryUnavailable));

        session.end_player_phase().expect("phase should end");
        assert_eq!(session.result(), BattleResult::Defeat);
        assert_eq!(session.end_player_phase().err(), Some(RuleError::BattleFinished));
        assert_eq!(session.retry(0).err(), Some(RuleError::RetryUnavailable));

        session.retry(1).expect("retry should reset");
        assert_eq!(session.result(), BattleResult::Ongoing);
        assert_eq!(session.player().stats.hp, 5);
        assert_eq!(session.enemies()[0].stats.hp, 65);
        assert!(session.is_player_phase());
    }

    #[test]
    fn outcome_reports_durability_and_counter_damage() {
        let mut setup = setup(
            &[("strike", 5)],
            vec![definition("slime", EnemyRank::Normal, 65, 5)],
        );
        setup.equipment = vec![raw_item(
            "spiked",
            &[("counter", 4.0), ("teleport", 1.0)],
        )];
        let mut session = session(setup);
        let card_id = first_in_hand(&session, "strike");
        session.play_card(CardPlay {
            card_id,
            target: Some(0),
        });
        session.end_player_phase().expect("phase should end");

        assert_eq!(session.enemies()[0].stats.hp, 65 - 10 - 4);
        let outcome = session.finish();
        assert_eq!(
            outcome.durability,
            vec![DurabilityDelta {
                item_id: "spiked".into(),
                lost: 1,
                remaining: 9,
            }]
        );
    }

    #[test]
    fn enemy_damage_over_time_can_finish_the_battle() {
        let mut session = session(setup(
            &[("strike", 5)],
            vec![definition("slime", EnemyRank::Normal, 6, 5)],
        ));
        session.enemies[0].stats = session.enemies[0]
            .stats
            .with_buffs(&[BuffApplication::new(BuffKind::Burn, 2, 6)]);
        let events = session.end_player_phase().expect("phase should end");
        assert!(events
            .iter()
            .any(|event| matches!(event, BattleEvent::DamageOverTime { amount: 6, .. })));
        assert_eq!(session.result(), BattleResult::Victory);
    }

    #[test]
    fn enemy_stops_when_energy_cannot_pay_for_the_next_action() {
        let mut brute = definition("brute", EnemyRank::Elite, 80, 15);
        brute.energy = 2;
        brute.ai_patterns = vec![
            AiPattern::rotation(1, EnemyAction::attack("Jab", 3, 1)),
            AiPattern::rotation(
                2,
                EnemyAction {
                    energy_cost: 2,
                    ..EnemyAction::attack("Heavy", 6, 1)
                },
            ),
        ];
        let mut session = session(setup(&[("strike", 5)], vec![brute]));

        let acted: Vec<&str> = session
            .events()
            .iter()
            .filter_map(|event| match event {
                BattleEvent::EnemyActed { action, .. } => Some(action.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(acted, vec!["Jab"]);
        assert_eq!(session.enemies()[0].turn_count, 1);
        assert_eq!(session.enemies()[0].energy, 1);

        let events = session.end_player_phase().expect("phase should end");
        let acted: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                BattleEvent::EnemyActed { action, .. } => Some(action.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(acted, vec!["Heavy"]);
        assert_eq!(session.enemies()[0].energy, 0);
        assert_eq!(session.player().stats.ap, 30 - 3 - 6);
    }

    #[test]
    fn first_action_of_a_phase_always_runs() {
        let mut ogre = definition("ogre", EnemyRank::Normal, 80, 5);
        ogre.ai_patterns = vec![AiPattern::rotation(
            1,
            EnemyAction {
                energy_cost: 3,
                ..EnemyAction::attack("Stomp", 5, 1)
            },
        )];
        let mut session = session(setup(&[("strike", 5)], vec![ogre]));
        session.end_player_phase().expect("phase should end");
        assert_eq!(session.enemies()[0].turn_count, 1);
        assert_eq!(session.player().stats.ap, 25);
    }

    #[test]
    fn guard_resets_at_the_start_of_its_owner_phase() {
        let mut turtle = definition("turtle", EnemyRank::Normal, 80, 5);
        turtle.ai_patterns = vec![
            AiPattern::rotation(1, EnemyAction::defend("Shell", 6)),
            AiPattern::rotation(2, EnemyAction::attack("Poke", 1, 1)),
        ];
        let mut session = session(setup(&[("brace", 5)], vec![turtle]));
        let card_id = first_in_hand(&session, "brace");
        assert!(session.play_card(CardPlay { card_id, target: None }).success);
        assert_eq!(session.player().stats.guard, 5);

        session.end_player_phase().expect("phase should end");
        assert_eq!(session.player().stats.guard, 0);
        assert_eq!(session.enemies()[0].stats.guard, 6);

        session.end_player_phase().expect("phase should end");
        assert_eq!(session.enemies()[0].stats.guard, 0);
        assert_eq!(session.player().stats.ap, 29);
    }

    #[test]
    fn unknown_equipment_skill_in_setup_json_is_skipped() {
        let json = r#"{
            "class": "swordsman",
            "stats": { "hp": 50, "max_hp": 50, "speed": 8 },
            "deck": { "strike": 5 },
            "equipment": [ {
                "id": "ring", "name": "Odd Ring", "level": 1,
                "durability": 5, "max_durability": 5,
                "skills": [
                    { "effect_type": "teleport", "value": 1 },
                    { "effect_type": "lifesteal", "value": 20 }
                ]
            } ],
            "enemies": [ { "id": "slime", "name": "Slime", "max_hp": 20, "speed": 4, "attack": 3 } ]
        }"#;
        let setup: BattleSetup = serde_json::from_str(json).expect("setup should parse");
        let session = session(setup);
        let ring = &session.player().equipment[0];
        assert_eq!(ring.skills.len(), 1);
        assert_eq!(
            EquipmentBonuses::aggregate(&session.player().equipment).lifesteal_percent,
            20
        );
    }

    #[test]
    fn enemies_with_invalid_patterns_are_dropped_from_setup() {
        let mut imp = definition("imp", EnemyRank::Normal, 30, 5);
        imp.ai_patterns = vec![
            AiPattern::weighted(0.6, EnemyAction::attack("Claw", 5, 1)),
            AiPattern::weighted(0.6, EnemyAction::attack("Bite", 6, 1)),
        ];
        let session = session(setup(
            &[("strike", 5)],
            vec![imp.clone(), definition("slime", EnemyRank::Normal, 30, 5)],
        ));
        assert_eq!(session.enemies().len(), 1);
        assert_eq!(session.enemies()[0].enemy_id, "slime");

        let only_invalid =
            BattleSession::with_seed(setup(&[("strike", 5)], vec![imp]), catalog(), config(), 3);
        assert_eq!(only_invalid.err(), Some(SetupError::NoEnemies));
    }

    #[test]
    fn out_of_range_armor_and_guard_are_clamped() {
        let mut setup = setup(
            &[("strike", 5)],
            vec![definition("slime", EnemyRank::Normal, 65, 5)],
        );
        setup.stats.ap = 50;
        setup.stats.guard = -3;
        let mut session = session(setup);
        assert_eq!(session.player().stats.ap, 30);
        assert_eq!(session.player().stats.guard, 0);

        let card_id = first_in_hand(&session, "strike");
        assert!(session
            .play_card(CardPlay {
                card_id,
                target: Some(0),
            })
            .success);
    }
}
