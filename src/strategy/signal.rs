//! Signal boundary
//!
//! The engine treats signal generation as a black box. Anything that turns
//! ticks into [`Signal`]s can drive a session; [`TickTrendSignal`] is the
//! minimal source the binary ships with.

use rust_decimal::Decimal;
use std::collections::VecDeque;
use tracing::debug;

use crate::domain::{Signal, SignalDirection, Tick};

/// Produces directional signals from the tick stream
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    /// Feed one live tick. `None` while still warming up.
    fn on_tick(&mut self, tick: &Tick) -> Option<Signal>;

    /// Seed from historical ticks; returns true if warm afterwards
    fn preload(&mut self, history: &[Tick]) -> bool {
        for tick in history {
            self.on_tick(tick);
        }
        self.is_warm()
    }

    fn is_warm(&self) -> bool;

    fn reset(&mut self);
}

/// Consecutive same-direction moves produce a signal.
///
/// Confidence is the share of moves in the trailing window that agree with
/// the direction of the latest streak.
#[derive(Debug, Clone)]
pub struct TickTrendSignal {
    symbol: String,
    window: usize,
    streak: usize,
    quotes: VecDeque<Decimal>,
}

impl TickTrendSignal {
    pub fn new(symbol: impl Into<String>, window: usize, streak: usize) -> Self {
        let window = window.max(1);
        Self {
            symbol: symbol.into(),
            window,
            streak: streak.clamp(1, window),
            quotes: VecDeque::with_capacity(window + 1),
        }
    }

    fn moves(&self) -> Vec<std::cmp::Ordering> {
        self.quotes
            .iter()
            .zip(self.quotes.iter().skip(1))
            .map(|(prev, next)| next.cmp(prev))
            .collect()
    }
}

impl SignalSource for TickTrendSignal {
    fn name(&self) -> &str {
        "tick_trend"
    }

    fn on_tick(&mut self, tick: &Tick) -> Option<Signal> {
        if tick.symbol != self.symbol {
            return None;
        }

        self.quotes.push_back(tick.quote);
        while self.quotes.len() > self.window + 1 {
            self.quotes.pop_front();
        }
        if !self.is_warm() {
            return None;
        }

        let moves = self.moves();
        let recent = &moves[moves.len() - self.streak..];
        let direction = if recent.iter().all(|m| m.is_gt()) {
            SignalDirection::Buy
        } else if recent.iter().all(|m| m.is_lt()) {
            SignalDirection::Sell
        } else {
            SignalDirection::None
        };

        let agreeing = match direction {
            SignalDirection::Buy => moves.iter().filter(|m| m.is_gt()).count(),
            SignalDirection::Sell => moves.iter().filter(|m| m.is_lt()).count(),
            SignalDirection::None => 0,
        };
        let confidence = agreeing as f64 / moves.len() as f64;

        debug!(
            "{} {:?} confidence {:.2} at {}",
            self.symbol, direction, confidence, tick.quote
        );
        Some(Signal::new(direction, confidence, self.symbol.clone()))
    }

    fn is_warm(&self) -> bool {
        self.quotes.len() > self.window
    }

    fn reset(&mut self) {
        self.quotes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(quote: Decimal) -> Tick {
        Tick {
            symbol: "R_100".into(),
            quote,
            epoch: 0,
        }
    }

    #[test]
    fn test_warmup_then_signal() {
        let mut source = TickTrendSignal::new("R_100", 3, 2);
        assert!(source.on_tick(&tick(dec!(1))).is_none());
        assert!(source.on_tick(&tick(dec!(2))).is_none());
        assert!(source.on_tick(&tick(dec!(3))).is_none());

        let signal = source.on_tick(&tick(dec!(4))).unwrap();
        assert_eq!(signal.direction, SignalDirection::Buy);
        assert_eq!(signal.confidence, 1.0);
    }

    #[test]
    fn test_mixed_moves() {
        let mut source = TickTrendSignal::new("R_100", 4, 2);
        for q in [dec!(5), dec!(6), dec!(5), dec!(4)] {
            source.on_tick(&tick(q));
        }
        let signal = source.on_tick(&tick(dec!(3))).unwrap();
        assert_eq!(signal.direction, SignalDirection::Sell);
        assert_eq!(signal.confidence, 0.75);

        let signal = source.on_tick(&tick(dec!(4))).unwrap();
        assert_eq!(signal.direction, SignalDirection::None);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn test_other_symbol_ignored() {
        let mut source = TickTrendSignal::new("R_50", 1, 1);
        assert!(source.on_tick(&tick(dec!(1))).is_none());
        assert!(!source.is_warm());
    }

    #[test]
    fn test_preload_warms() {
        let mut source = TickTrendSignal::new("R_100", 3, 1);
        let history: Vec<Tick> = [dec!(1), dec!(2), dec!(3), dec!(4)].into_iter().map(tick).collect();
        assert!(source.preload(&history));

        source.reset();
        assert!(!source.is_warm());
    }
}
