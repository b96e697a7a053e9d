pub mod clock;
pub mod money;

pub use clock::{now_iso, now_naive, parse_iso};
pub use money::{money_to_f64, money_txt, parse_quantity};
