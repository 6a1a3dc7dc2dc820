//! Item catalogue: names used across the inventory model and the templates.

pub const BOW: &str = "bow";
pub const ARROWS: &str = "arrows";
pub const SILVER_ARROWS: &str = "silver_arrows";

/// One-way upgrade pairs as (inferior, superior).
pub const UPGRADES: [(&str, &str); 3] = [
    ("blue_candle", "red_candle"),
    ("blue_ring", "red_ring"),
    ("boomerang", "magical_boomerang"),
];

/// The superior item that replaces `item`, if `item` is the lesser half of an upgrade pair.
pub fn superior_of(item: &str) -> Option<&'static str> {
    UPGRADES
        .iter()
        .find(|(inferior, _)| *inferior == item)
        .map(|(_, superior)| *superior)
}

/// The inferior item replaced by `item`, if `item` is the better half of an upgrade pair.
pub fn inferior_of(item: &str) -> Option<&'static str> {
    UPGRADES
        .iter()
        .find(|(_, superior)| *superior == item)
        .map(|(inferior, _)| *inferior)
}

/// Drops that refill a counter instead of entering the inventory.
pub const CONSUMABLES: [&str; 7] = ["heart", "fairy", "rupee", "blue_rupee", "bomb", "clock", "key"];

pub fn is_consumable(name: &str) -> bool {
    CONSUMABLES.contains(&name)
}

/// Sword level encoded by a sword template name.
pub fn sword_level(name: &str) -> Option<u8> {
    match name {
        "wood_sword" => Some(1),
        "white_sword" => Some(2),
        "magical_sword" => Some(3),
        _ => None,
    }
}

/// Arrows level implied by a B-item name.
pub fn arrows_level(name: &str) -> Option<u8> {
    match name {
        ARROWS => Some(1),
        SILVER_ARROWS => Some(2),
        _ => None,
    }
}
