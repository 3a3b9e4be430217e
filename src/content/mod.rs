//! 内置内容：卡牌目录与敌人注册表，首次访问时从嵌入的 JSON 解析。

pub mod cards;
pub mod enemies;

pub use cards::{default_catalog, load_card_catalog, CardContent};
pub use enemies::{default_enemies, EnemyRegistry};
