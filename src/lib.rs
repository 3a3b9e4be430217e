pub mod ai;
pub mod content;
pub mod error;
pub mod game;

use std::str::FromStr;

use gloo_timers::future::TimeoutFuture;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::future_to_promise;
use web_sys::js_sys::Promise;

pub use ai::{AiPattern, DecisionSource, EnemyAction, EnemyDecision, EnemyDefinition, HpCondition};
pub use content::{default_catalog, default_enemies, load_card_catalog, EnemyRegistry};
pub use error::{ContentDiagnostic, ContentError, SetupError};
pub use game::{
    BattleConfig, BattleEvent, BattleOutcome, BattleResult, BattleSession, BattleSetup,
    BattleSnapshot, CardCatalog, CardExecutionResult, CardPlay, EncounterKind, EscapeAttempt,
    RuleError,
};

#[cfg(feature = "wee_alloc")]
#[global_allocator]
static ALLOC: wee_alloc::WeeAlloc = wee_alloc::WeeAlloc::INIT;

#[wasm_bindgen(start)]
pub fn start() {
    set_panic_hook();
    web_sys::console::log_1(&"card battle core 已加载".into());
}

fn to_js_error<E: Serialize>(error: E) -> JsValue {
    to_value(&error).unwrap_or_else(|serialize_err| JsValue::from_str(&serialize_err.to_string()))
}

fn serde_to_js_error<E: std::fmt::Display>(error: E) -> JsValue {
    JsValue::from_str(&error.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, JsValue> {
    serde_json::to_string(value).map_err(serde_to_js_error)
}

fn rng_from(seed: Option<u64>) -> SmallRng {
    match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    }
}

/// 每次操作返回给界面的内容：是否成功、失败原因、操作结果、本次新增事件、最新快照。
/// 被规则拒绝的操作同样以 `success: false` 返回，不抛出异常。
#[derive(Serialize)]
struct StepResponse<'a, T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RuleError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<T>,
    events: &'a [BattleEvent],
    snapshot: BattleSnapshot,
}

/// 只读查询的返回内容。
#[derive(Serialize)]
struct QueryResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RuleError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<T>,
}

impl<T: Serialize> From<Result<T, RuleError>> for QueryResponse<T> {
    fn from(outcome: Result<T, RuleError>) -> Self {
        match outcome {
            Ok(result) => Self {
                success: true,
                reason: None,
                error: None,
                result: Some(result),
            },
            Err(error) => Self {
                success: false,
                reason: Some(error.to_string()),
                error: Some(error),
                result: None,
            },
        }
    }
}

#[wasm_bindgen]
pub struct BattleEngine {
    session: BattleSession,
    seen_events: usize,
}

#[wasm_bindgen]
impl BattleEngine {
    /// 由开战数据构建战斗；不传 `seed` 时使用系统熵。
    #[wasm_bindgen(constructor)]
    pub fn new(
        setup_json: &str,
        config_json: Option<String>,
        seed: Option<u64>,
    ) -> Result<BattleEngine, JsValue> {
        let setup: BattleSetup = serde_json::from_str(setup_json)
            .map_err(|error| to_js_error(SetupError::Malformed {
                message: error.to_string(),
            }))?;
        let config = match config_json {
            Some(json) => BattleConfig::from_json(&json).map_err(serde_to_js_error)?,
            None => BattleConfig::default(),
        };
        let session = BattleSession::new(setup, default_catalog(), config, rng_from(seed))
            .map_err(to_js_error)?;
        Ok(BattleEngine {
            session,
            seen_events: 0,
        })
    }

    pub fn snapshot_json(&self) -> Result<String, JsValue> {
        to_json(&self.session.snapshot())
    }

    /// 完整事件日志。
    pub fn events_json(&self) -> Result<String, JsValue> {
        to_json(&self.session.events())
    }

    pub fn play_card_json(&mut self, play_json: &str) -> Result<String, JsValue> {
        let play: CardPlay = serde_json::from_str(play_json).map_err(serde_to_js_error)?;
        let result = self.session.play_card(play);
        let (success, reason) = (result.success, result.reason.clone());
        self.respond(success, reason, None, Some(result))
            .map_err(serde_to_js_error)
    }

    pub fn end_phase_json(&mut self) -> Result<String, JsValue> {
        let outcome = self
            .session
            .end_player_phase()
            .map(|_| self.session.result());
        self.respond_with(outcome).map_err(serde_to_js_error)
    }

    pub fn attempt_escape_json(&mut self) -> Result<String, JsValue> {
        let outcome = self.session.attempt_escape();
        self.respond_with(outcome).map_err(serde_to_js_error)
    }

    pub fn retry_json(&mut self, lives_remaining: u32) -> Result<String, JsValue> {
        let outcome = self.session.retry(lives_remaining).map(|_| {
            self.seen_events = 0;
            self.session.result()
        });
        self.respond_with(outcome).map_err(serde_to_js_error)
    }

    pub fn preview_enemy_action_json(&self, index: usize) -> Result<String, JsValue> {
        let response = QueryResponse::from(self.session.preview_enemy_action(index));
        to_json(&response)
    }

    /// 延迟 `delay_ms` 后给出敌人意图预览，供界面表现“思考”。
    pub fn think_enemy(&self, index: usize, delay_ms: Option<u32>) -> Promise {
        let session = self.session.clone();
        let delay = delay_ms.unwrap_or(0);

        future_to_promise(async move {
            if delay > 0 {
                TimeoutFuture::new(delay).await;
            }
            let response = QueryResponse::from(session.preview_enemy_action(index));
            let json = to_json(&response)?;
            Ok(JsValue::from_str(&json))
        })
    }

    pub fn outcome_json(&self) -> Result<String, JsValue> {
        to_json(&self.session.finish())
    }
}

impl BattleEngine {
    fn respond_with<T: Serialize>(
        &mut self,
        outcome: Result<T, RuleError>,
    ) -> serde_json::Result<String> {
        match outcome {
            Ok(result) => self.respond(true, None, None, Some(result)),
            Err(error) => {
                let reason = Some(error.to_string());
                self.respond::<()>(false, reason, Some(error), None)
            }
        }
    }

    fn respond<T: Serialize>(
        &mut self,
        success: bool,
        reason: Option<String>,
        error: Option<RuleError>,
        result: Option<T>,
    ) -> serde_json::Result<String> {
        let events = self.session.events();
        let fresh = events.get(self.seen_events..).unwrap_or(&[]);
        let json = serde_json::to_string(&StepResponse {
            success,
            reason,
            error,
            result,
            events: fresh,
            snapshot: self.session.snapshot(),
        });
        self.seen_events = events.len();
        json
    }
}

#[wasm_bindgen(js_name = "escapeChance")]
pub fn escape_chance(player_speed: i32, enemy_speed: i32) -> f64 {
    game::escape_chance(player_speed, enemy_speed, &BattleConfig::default())
}

#[wasm_bindgen(js_name = "masteryLevel")]
pub fn mastery_level(use_count: u32) -> u8 {
    BattleConfig::default().mastery_level(use_count)
}

/// 通用抽牌：牌可以是任意 JS 值。
#[wasm_bindgen(js_name = "drawCards")]
pub fn draw_cards(
    count: usize,
    draw_pile: JsValue,
    discard_pile: JsValue,
    seed: Option<u64>,
) -> Result<JsValue, JsValue> {
    let draw_pile: Vec<serde_json::Value> = from_value(draw_pile).map_err(JsValue::from)?;
    let discard_pile: Vec<serde_json::Value> = from_value(discard_pile).map_err(JsValue::from)?;
    let mut rng = rng_from(seed);
    let result = game::draw(count, &draw_pile, &discard_pile, &mut rng);
    to_value(&result).map_err(JsValue::from)
}

#[wasm_bindgen(js_name = "shuffleCards")]
pub fn shuffle_cards(pile: JsValue, seed: Option<u64>) -> Result<JsValue, JsValue> {
    let pile: Vec<serde_json::Value> = from_value(pile).map_err(JsValue::from)?;
    let mut rng = rng_from(seed);
    to_value(&game::shuffle(&pile, &mut rng)).map_err(JsValue::from)
}

/// 内置卡牌模板列表。
#[wasm_bindgen(js_name = "cardTemplatesJson")]
pub fn card_templates_json() -> Result<String, JsValue> {
    let catalog = default_catalog();
    let templates: Vec<_> = catalog.templates().collect();
    to_json(&templates)
}

/// 从内置注册表为指定深度抽取一组敌人定义。
#[wasm_bindgen(js_name = "encounterJson")]
pub fn encounter_json(depth: u32, kind: &str, seed: Option<u64>) -> Result<String, JsValue> {
    let kind = EncounterKind::from_str(kind).map_err(|message| JsValue::from_str(&message))?;
    let mut rng = rng_from(seed);
    to_json(&default_enemies().encounter(depth, kind, &mut rng))
}

#[wasm_bindgen(js_name = "transferSouls")]
pub fn transfer_souls(remnant: u32, survived: bool) -> u32 {
    game::transfer_souls(remnant, survived, &BattleConfig::default())
}

#[cfg(feature = "console_error_panic_hook")]
fn set_panic_hook() {
    console_error_panic_hook::set_once();
}

#[cfg(not(feature = "console_error_panic_hook"))]
fn set_panic_hook() {}
