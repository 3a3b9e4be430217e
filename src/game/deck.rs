//! 牌堆管理：抽牌、弃牌、洗牌与初始牌组生成。全部为纯函数，不修改入参。

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::cards::{Card, CardCatalog, CardInstanceId, CardTypeId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrawResult<T> {
    pub drawn: Vec<T>,
    pub draw_pile: Vec<T>,
    pub discard_pile: Vec<T>,
    /// 抽牌过程中弃牌堆是否被洗回抽牌堆。
    pub reshuffled: bool,
}

/// 从抽牌堆顶（末尾）抽至多 `count` 张；抽牌堆耗尽时把弃牌堆洗匀后接续抽取。
/// 两堆都空时返回少于请求数量的牌，从不报错。
pub fn draw<T: Clone, R: Rng + ?Sized>(
    count: usize,
    draw_pile: &[T],
    discard_pile: &[T],
    rng: &mut R,
) -> DrawResult<T> {
    let mut draw_pile = draw_pile.to_vec();
    let mut discard_pile = discard_pile.to_vec();
    let mut drawn = Vec::with_capacity(count);
    let mut reshuffled = false;

    while drawn.len() < count {
        if draw_pile.is_empty() {
            if discard_pile.is_empty() {
                break;
            }
            let recycled = shuffle(&discard_pile, rng);
            discard_pile.clear();
            draw_pile.extend(recycled);
            reshuffled = true;
        }
        if let Some(card) = draw_pile.pop() {
            drawn.push(card);
        }
    }

    DrawResult {
        drawn,
        draw_pile,
        discard_pile,
        reshuffled,
    }
}

/// 按顺序追加到弃牌堆末尾。
pub fn discard<T: Clone>(cards: &[T], discard_pile: &[T]) -> Vec<T> {
    let mut pile = Vec::with_capacity(discard_pile.len() + cards.len());
    pile.extend_from_slice(discard_pile);
    pile.extend_from_slice(cards);
    pile
}

/// Fisher-Yates 均匀洗牌，返回新牌堆。
pub fn shuffle<T: Clone, R: Rng + ?Sized>(pile: &[T], rng: &mut R) -> Vec<T> {
    let mut shuffled = pile.to_vec();
    if shuffled.len() > 1 {
        shuffled.shuffle(rng);
    }
    shuffled
}

/// 卡牌实例 id 分配器。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardIdAllocator {
    next: CardInstanceId,
}

impl CardIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn allocate(&mut self) -> CardInstanceId {
        let id = self.next;
        self.next += 1;
        id
    }
}

impl Default for CardIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// 把 `卡牌类型 -> 数量` 展开为带唯一 id 的卡牌实例并洗匀；未知类型静默跳过。
pub fn create_initial_deck<R: Rng + ?Sized>(
    card_counts: &BTreeMap<CardTypeId, u32>,
    catalog: &CardCatalog,
    ids: &mut CardIdAllocator,
    rng: &mut R,
) -> Vec<Card> {
    let mut deck = Vec::new();
    for (card_type_id, count) in card_counts {
        let Some(template) = catalog.template(card_type_id) else {
            continue;
        };
        for _ in 0..*count {
            deck.push(catalog.instantiate(template, ids.allocate()));
        }
    }
    shuffle(&deck, rng)
}

/// 战斗中的三堆牌：抽牌堆、手牌、弃牌堆。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeckState {
    pub draw_pile: Vec<Card>,
    pub hand: Vec<Card>,
    pub discard_pile: Vec<Card>,
}

impl DeckState {
    pub fn new(draw_pile: Vec<Card>) -> Self {
        Self {
            draw_pile,
            hand: Vec::new(),
            discard_pile: Vec::new(),
        }
    }

    pub fn find_in_hand(&self, card_id: CardInstanceId) -> Option<&Card> {
        self.hand.iter().find(|card| card.id == card_id)
    }

    /// 抽牌进手，返回新的牌堆状态与本次抽到的牌 id。
    pub fn draw_into_hand<R: Rng + ?Sized>(
        &self,
        count: usize,
        rng: &mut R,
    ) -> (Self, Vec<CardInstanceId>, bool) {
        let result = draw(count, &self.draw_pile, &self.discard_pile, rng);
        let drawn_ids = result.drawn.iter().map(|card| card.id).collect();
        let mut hand = self.hand.clone();
        hand.extend(result.drawn);
        (
            Self {
                draw_pile: result.draw_pile,
                hand,
                discard_pile: result.discard_pile,
            },
            drawn_ids,
            result.reshuffled,
        )
    }

    /// 把一张手牌（已更新的实例）移入弃牌堆。
    pub fn play_from_hand(&self, played: &Card) -> Self {
        let hand = self
            .hand
            .iter()
            .filter(|card| card.id != played.id)
            .cloned()
            .collect();
        Self {
            draw_pile: self.draw_pile.clone(),
            hand,
            discard_pile: discard(std::slice::from_ref(played), &self.discard_pile),
        }
    }

    /// 回合结束时整手弃掉。
    pub fn discard_hand(&self) -> Self {
        Self {
            draw_pile: self.draw_pile.clone(),
            hand: Vec::new(),
            discard_pile: discard(&self.hand, &self.discard_pile),
        }
    }

    pub fn total_cards(&self) -> usize {
        self.draw_pile.len() + self.hand.len() + self.discard_pile.len()
    }

    pub fn all_cards(&self) -> impl Iterator<Item = &Card> {
        self.draw_pile
            .iter()
            .chain(self.hand.iter())
            .chain(self.discard_pile.iter())
    }
}
