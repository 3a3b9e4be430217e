use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use card_battle_core::ai::{determine_enemy_action, AiPattern, EnemyAction};
use card_battle_core::game::{
    draw, escape_chance, BattleConfig, BattleResult, BattleSession, BattleSetup, CardPlay,
    CharacterClass, CombatantStats, EncounterKind, EnemyRank, RuleError,
};
use card_battle_core::{default_catalog, default_enemies, load_card_catalog, EnemyDefinition};
use rand::rngs::SmallRng;
use rand::SeedableRng;

const LETHAL_CARDS: &str = r#"{
    "cards": [
        { "card_type_id": "meteor", "name": "Meteor", "cost": 1, "base_damage": 70,
          "category": "attack", "effect": { "type": "damage" } }
    ]
}"#;

fn no_crit() -> BattleConfig {
    BattleConfig {
        base_crit_chance: 0.0,
        ..BattleConfig::default()
    }
}

fn slime(hp: i32) -> EnemyDefinition {
    EnemyDefinition {
        id: "slime".into(),
        name: "Slime".into(),
        rank: EnemyRank::Normal,
        depth: 1,
        max_hp: hp,
        max_ap: 0,
        speed: 5,
        attack: 5,
        energy: 1,
        ai_patterns: Vec::new(),
    }
}

fn setup(deck: &[(&str, u32)], enemies: Vec<EnemyDefinition>) -> BattleSetup {
    BattleSetup {
        class: CharacterClass::Swordsman,
        stats: CombatantStats::new(500, 20, 8),
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

/// 简单自动战斗：能出就出，出不了就结束阶段。
fn auto_play(session: &mut BattleSession, max_steps: usize) {
    for _ in 0..max_steps {
        if session.result().is_terminal() {
            return;
        }
        let Some(target) = session.enemies().iter().position(|enemy| enemy.is_alive()) else {
            return;
        };
        let hand: Vec<_> = session.deck().hand.iter().map(|card| card.id).collect();
        let played = hand.into_iter().any(|card_id| {
            session
                .play_card(CardPlay {
                    card_id,
                    target: Some(target),
                })
                .success
        });
        if !played {
            session
                .end_player_phase()
                .expect("ending an open player phase should succeed");
        }
    }
}

#[test]
fn draw_reshuffles_discard_when_pile_runs_out() {
    let mut rng = SmallRng::seed_from_u64(3);
    let result = draw(3, &["a"], &["b", "c"], &mut rng);
    assert_eq!(result.drawn.len(), 3);
    assert_eq!(result.drawn[0], "a");
    assert!(result.draw_pile.is_empty());
    assert!(result.discard_pile.is_empty());
    assert!(result.reshuffled);

    let short = draw(4, &["a"], &[], &mut rng);
    assert_eq!(short.drawn, vec!["a"]);
}

#[test]
fn lethal_opening_play_wins_with_single_rewards() {
    let (catalog, diagnostics) =
        load_card_catalog(LETHAL_CARDS, "inline").expect("inline cards should parse");
    assert!(diagnostics.is_empty());
    let mut session = BattleSession::with_seed(
        setup(&[("meteor", 5)], vec![slime(65)]),
        Arc::new(catalog),
        no_crit(),
        11,
    )
    .expect("session should start");

    let card_id = session.deck().hand[0].id;
    let result = session.play_card(CardPlay {
        card_id,
        target: Some(0),
    });
    assert!(result.success);
    assert_eq!(session.enemies()[0].stats.hp, 0);
    assert_eq!(session.result(), BattleResult::Victory);

    let rewards = session.finish().rewards.expect("victory should carry rewards");
    assert_eq!(rewards.encounter, EncounterKind::Single);
    assert_eq!(rewards.souls_gained, 10);

    assert_eq!(
        session.end_player_phase().expect_err("terminal battle should refuse"),
        RuleError::BattleFinished
    );
    assert_eq!(session.result(), BattleResult::Victory);
}

#[test]
fn default_content_battle_runs_to_victory() {
    let mut session = BattleSession::with_seed(
        setup(&[("slash", 6), ("parry", 2), ("iai_release", 2)], vec![slime(28)]),
        default_catalog(),
        BattleConfig::default(),
        5,
    )
    .expect("session should start");
    auto_play(&mut session, 200);

    assert_eq!(session.result(), BattleResult::Victory);
    let outcome = session.finish();
    assert!(outcome.mastery_deltas.values().sum::<u32>() > 0);
    assert!(outcome.rewards.is_some());
}

#[test]
fn registry_encounter_feeds_a_session() {
    let registry = default_enemies();
    let mut rng = SmallRng::seed_from_u64(8);
    let enemies = registry.encounter(1, EncounterKind::Double, &mut rng);
    assert_eq!(enemies.len(), 2);

    let session = BattleSession::with_seed(
        setup(&[("slash", 10)], enemies),
        default_catalog(),
        BattleConfig::default(),
        8,
    )
    .expect("session should start");
    assert_eq!(session.enemies().len(), 2);
    assert_eq!(session.result(), BattleResult::Ongoing);
}

#[test]
fn boss_battles_forbid_escape() {
    let registry = default_enemies();
    let boss = registry.get("bone_king").expect("bone king is embedded").clone();
    let mut session = BattleSession::with_seed(
        setup(&[("slash", 10)], vec![boss]),
        default_catalog(),
        BattleConfig::default(),
        2,
    )
    .expect("session should start");
    assert_eq!(
        session.attempt_escape().expect_err("boss escape should fail"),
        RuleError::EscapeForbidden
    );
    assert_eq!(session.result(), BattleResult::Ongoing);
}

#[test]
fn setup_round_trips_through_json() {
    let json = r#"{
        "class": "mage",
        "stats": { "hp": 60, "max_hp": 60, "speed": 9 },
        "deck": { "firebolt": 4, "frost_needle": 4 },
        "mastery": { "firebolt": 14 },
        "enemies": [ { "id": "slime", "name": "Slime", "max_hp": 28, "speed": 4, "attack": 5 } ]
    }"#;
    let setup: BattleSetup = serde_json::from_str(json).expect("setup json should parse");
    assert_eq!(setup.depth, 1);
    assert!(setup.escape_allowed);

    let session = BattleSession::with_seed(setup, default_catalog(), BattleConfig::default(), 4)
        .expect("session should start");
    let firebolt = session
        .deck()
        .all_cards()
        .find(|card| card.card_type_id == "firebolt")
        .expect("firebolt should be in the deck");
    assert_eq!(firebolt.mastery_level, 1);
    assert_eq!(session.deck().total_cards(), 8);
}

#[test]
fn escape_odds_are_clamped() {
    let config = BattleConfig::default();
    assert!((escape_chance(10, 10, &config) - 0.4).abs() < 1e-9);
    assert!((escape_chance(100, 1, &config) - 0.95).abs() < 1e-9);
    assert!((escape_chance(1, 100, &config) - 0.1).abs() < 1e-9);
}

#[test]
fn weighted_patterns_follow_their_probabilities() {
    let mut definition = slime(40);
    definition.ai_patterns = vec![
        AiPattern::weighted(0.7, EnemyAction::attack("Bite", 4, 1)),
        AiPattern::weighted(0.3, EnemyAction::defend("Shell", 6)),
    ];
    let mut rng = SmallRng::seed_from_u64(99);
    let samples = 10_000;
    let bites = (0..samples)
        .filter(|turn| {
            determine_enemy_action(&definition, 40, 40, *turn, &mut rng).action.name == "Bite"
        })
        .count();
    let ratio = bites as f64 / samples as f64;
    assert!((ratio - 0.7).abs() < 0.03, "bite ratio was {ratio}");
}

#[test]
fn mastery_levels_follow_thresholds() {
    let config = BattleConfig::default();
    let levels: Vec<u8> = [0, 4, 5, 14, 15, 29, 30, 100]
        .iter()
        .map(|uses| config.mastery_level(*uses))
        .collect();
    assert_eq!(levels, vec![0, 0, 1, 1, 2, 2, 3, 3]);
}
