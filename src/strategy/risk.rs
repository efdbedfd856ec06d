use crate::config::RiskConfig;
use crate::domain::{HaltReason, Outcome};
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// Lookahead at martingale level 0
const FRESH_LOOKAHEAD: u32 = 3;
/// Lookahead once inside a loss sequence
const RECOVERY_LOOKAHEAD: u32 = 2;

/// Result of a stake check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StakeDecision {
    /// Requested stake fits under the ceiling
    Approved(Decimal),
    /// Requested stake reduced to the largest safe stake
    Capped { stake: Decimal, requested: Decimal },
    /// Even the broker minimum would breach the ceiling
    Halt(HaltReason),
}

impl StakeDecision {
    pub fn stake(&self) -> Option<Decimal> {
        match self {
            StakeDecision::Approved(stake) | StakeDecision::Capped { stake, .. } => Some(*stake),
            StakeDecision::Halt(_) => None,
        }
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, StakeDecision::Halt(_))
    }
}

/// Multiplier tier picked from the rolling win rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplierTier {
    Aggressive,
    Normal,
    Conservative,
}

impl MultiplierTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MultiplierTier::Aggressive => "aggressive",
            MultiplierTier::Normal => "normal",
            MultiplierTier::Conservative => "conservative",
        }
    }
}

/// Session figures the stop checks look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskSnapshot {
    pub baseline_balance: Decimal,
    pub balance: Decimal,
    pub session_pnl: Decimal,
    pub daily_pnl: Decimal,
    pub consecutive_losses: u32,
}

/// Stake sizing and stop conditions. Holds no session state.
#[derive(Debug, Clone)]
pub struct RiskController {
    config: RiskConfig,
}

impl RiskController {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn min_stake(&self) -> Decimal {
        self.config.min_stake
    }

    pub fn max_level(&self) -> u32 {
        self.config.max_martingale_level
    }

    /// Number of levels projected ahead from `level`
    pub fn lookahead(level: u32) -> u32 {
        if level == 0 {
            FRESH_LOOKAHEAD
        } else {
            RECOVERY_LOOKAHEAD
        }
    }

    /// Exposure ceiling as a fraction of balance
    pub fn ceiling_fraction(&self, level: u32) -> Decimal {
        if level == 0 {
            self.config.fresh_exposure_fraction
        } else {
            self.config.recovery_exposure_fraction
        }
    }

    /// Total stake committed if the next `lookahead(level)` orders all lose:
    /// `stake * (1 + m + m^2 + ...)`
    pub fn projected_exposure(&self, stake: Decimal, multiplier: Decimal, level: u32) -> Decimal {
        stake * Self::series_factor(multiplier, Self::lookahead(level))
    }

    /// Largest stake whose projected exposure stays under the ceiling
    pub fn max_stake(&self, level: u32, multiplier: Decimal, balance: Decimal) -> Decimal {
        if balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let ceiling = balance * self.ceiling_fraction(level);
        let factor = Self::series_factor(multiplier, Self::lookahead(level));
        if factor <= Decimal::ZERO {
            return ceiling;
        }
        ceiling / factor
    }

    /// Approve, cap or halt a stake.
    ///
    /// Halts only when the broker minimum itself would breach the ceiling;
    /// anything above the ceiling is capped so loss sequences can complete.
    pub fn max_safe_stake(
        &self,
        level: u32,
        requested: Decimal,
        multiplier: Decimal,
        balance: Decimal,
    ) -> StakeDecision {
        let max_stake = self.max_stake(level, multiplier, balance);

        if max_stake < self.config.min_stake {
            warn!(
                "Broker minimum ${} exceeds safe stake ${} at level {} (balance ${})",
                self.config.min_stake,
                max_stake.round_dp(2),
                level,
                balance
            );
            return StakeDecision::Halt(HaltReason::ExposureCeiling { balance });
        }

        let wanted = requested.max(self.config.min_stake);
        if wanted > max_stake {
            debug!(
                "Stake ${} capped to ${} at level {}",
                wanted,
                max_stake.round_dp(2),
                level
            );
            StakeDecision::Capped {
                stake: max_stake,
                requested: wanted,
            }
        } else {
            StakeDecision::Approved(wanted)
        }
    }

    /// Tier for the next loss, from the rolling win rate
    pub fn multiplier_tier(&self, win_rate: f64, samples: usize) -> MultiplierTier {
        if samples < self.config.tier_min_samples {
            MultiplierTier::Normal
        } else if win_rate >= self.config.aggressive_win_rate {
            MultiplierTier::Aggressive
        } else if win_rate < self.config.conservative_win_rate {
            MultiplierTier::Conservative
        } else {
            MultiplierTier::Normal
        }
    }

    pub fn next_multiplier(&self, win_rate: f64, samples: usize) -> Decimal {
        match self.multiplier_tier(win_rate, samples) {
            MultiplierTier::Aggressive => self.config.multiplier_aggressive,
            MultiplierTier::Normal => self.config.multiplier_normal,
            MultiplierTier::Conservative => self.config.multiplier_conservative,
        }
    }

    /// Multiplier for an outcome history (oldest first)
    pub fn multiplier_for(&self, history: &[Outcome]) -> Decimal {
        let (rate, samples) = win_rate(history);
        self.next_multiplier(rate, samples)
    }

    /// First tripped stop condition, if any
    pub fn should_halt(&self, snapshot: &RiskSnapshot) -> Option<HaltReason> {
        if self.config.max_consecutive_losses > 0
            && snapshot.consecutive_losses >= self.config.max_consecutive_losses
        {
            return Some(HaltReason::MaxConsecutiveLosses {
                count: snapshot.consecutive_losses,
            });
        }

        let session_loss = -snapshot.session_pnl;
        let session_limit = snapshot.baseline_balance * self.config.max_session_loss_fraction;
        if session_loss > Decimal::ZERO && session_loss > session_limit {
            return Some(HaltReason::SessionLossLimit {
                loss: session_loss,
                limit: session_limit,
            });
        }

        let daily_loss = -snapshot.daily_pnl;
        if daily_loss > self.config.daily_loss_limit {
            return Some(HaltReason::DailyLossLimit {
                loss: daily_loss,
                limit: self.config.daily_loss_limit,
            });
        }

        if snapshot.balance < self.config.min_stake {
            return Some(HaltReason::InsufficientBalance {
                balance: snapshot.balance,
                min_stake: self.config.min_stake,
            });
        }

        None
    }

    fn series_factor(multiplier: Decimal, terms: u32) -> Decimal {
        let mut factor = Decimal::ZERO;
        let mut term = Decimal::ONE;
        for _ in 0..terms {
            factor += term;
            term *= multiplier;
        }
        factor
    }
}

/// Win rate and sample count of an outcome window
pub fn win_rate(history: &[Outcome]) -> (f64, usize) {
    if history.is_empty() {
        return (0.0, 0);
    }
    let wins = history.iter().filter(|o| o.is_win()).count();
    (wins as f64 / history.len() as f64, history.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn controller() -> RiskController {
        RiskController::new(RiskConfig::default())
    }

    #[test]
    fn test_projected_exposure_uses_level_lookahead() {
        let risk = controller();
        // 1 + 2 + 4
        assert_eq!(risk.projected_exposure(dec!(1), dec!(2), 0), dec!(7));
        // 1 + 2
        assert_eq!(risk.projected_exposure(dec!(1), dec!(2), 3), dec!(3));
    }

    #[test]
    fn test_max_safe_stake_approves_small_stake() {
        let risk = controller();
        let decision = risk.max_safe_stake(0, dec!(0.50), dec!(2.1), dec!(1000));
        assert_eq!(decision, StakeDecision::Approved(dec!(0.50)));
    }

    #[test]
    fn test_max_safe_stake_raises_to_minimum() {
        let risk = controller();
        let decision = risk.max_safe_stake(0, dec!(0.10), dec!(2.1), dec!(1000));
        assert_eq!(decision.stake(), Some(dec!(0.35)));
    }

    #[test]
    fn test_max_safe_stake_caps_large_stake() {
        let risk = controller();
        // level 2: ceiling 50 (50% of 100), factor 1 + 2 = 3
        let decision = risk.max_safe_stake(2, dec!(40), dec!(2), dec!(100));
        match decision {
            StakeDecision::Capped { stake, requested } => {
                assert_eq!(requested, dec!(40));
                assert_eq!(stake.round_dp(4), dec!(16.6667));
            }
            other => panic!("expected cap, got {:?}", other),
        }
    }

    #[test]
    fn test_max_safe_stake_halts_when_minimum_breaches() {
        let risk = controller();
        // level 0: ceiling 0.25, factor 7.51 -> max ~0.033
        let decision = risk.max_safe_stake(0, dec!(0.35), dec!(2.1), dec!(1));
        assert!(decision.is_halt());
        assert_eq!(
            decision,
            StakeDecision::Halt(HaltReason::ExposureCeiling { balance: dec!(1) })
        );
    }

    #[test]
    fn test_max_safe_stake_never_below_minimum() {
        let risk = controller();
        for balance in [dec!(1), dec!(5), dec!(10), dec!(50), dec!(500)] {
            for level in 0..=5 {
                for stake in [dec!(0.35), dec!(1), dec!(10), dec!(100)] {
                    match risk.max_safe_stake(level, stake, dec!(2.5), balance) {
                        StakeDecision::Halt(_) => {}
                        decision => assert!(decision.stake().unwrap() >= risk.min_stake()),
                    }
                }
            }
        }
    }

    #[test]
    fn test_max_stake_non_increasing_in_multiplier() {
        let risk = controller();
        let balance = dec!(1000);
        for level in 0..=5 {
            let mut previous = risk.max_stake(level, dec!(1.5), balance);
            for multiplier in [dec!(1.8), dec!(2.1), dec!(2.5), dec!(3.0)] {
                let current = risk.max_stake(level, multiplier, balance);
                assert!(current <= previous, "level {} multiplier {}", level, multiplier);
                previous = current;
            }
        }
    }

    #[test]
    fn test_max_stake_non_increasing_in_level_within_sequence() {
        let risk = controller();
        let balance = dec!(1000);
        let mut previous = risk.max_stake(1, dec!(2.1), balance);
        for level in 2..=5 {
            let current = risk.max_stake(level, dec!(2.1), balance);
            assert!(current <= previous);
            previous = current;
        }
    }

    #[test]
    fn test_multiplier_tiers() {
        let risk = controller();
        // Not enough samples: normal regardless of rate
        assert_eq!(risk.next_multiplier(1.0, 5), dec!(2.1));
        assert_eq!(risk.next_multiplier(0.7, 20), dec!(2.5));
        assert_eq!(risk.next_multiplier(0.6, 20), dec!(2.5));
        assert_eq!(risk.next_multiplier(0.5, 20), dec!(2.1));
        assert_eq!(risk.next_multiplier(0.4, 20), dec!(2.1));
        assert_eq!(risk.next_multiplier(0.3, 20), dec!(1.8));
    }

    #[test]
    fn test_multiplier_for_history() {
        let risk = controller();
        let mut history = vec![Outcome::Win; 8];
        history.extend([Outcome::Loss; 2]);
        assert_eq!(risk.multiplier_for(&history), dec!(2.5));
        assert_eq!(risk.multiplier_for(&[]), dec!(2.1));
    }

    fn snapshot() -> RiskSnapshot {
        RiskSnapshot {
            baseline_balance: dec!(1000),
            balance: dec!(1000),
            session_pnl: Decimal::ZERO,
            daily_pnl: Decimal::ZERO,
            consecutive_losses: 0,
        }
    }

    #[test]
    fn test_should_halt_clear() {
        assert_eq!(controller().should_halt(&snapshot()), None);
    }

    #[test]
    fn test_should_halt_consecutive_losses() {
        let s = RiskSnapshot {
            consecutive_losses: 5,
            ..snapshot()
        };
        assert_eq!(
            controller().should_halt(&s),
            Some(HaltReason::MaxConsecutiveLosses { count: 5 })
        );
    }

    #[test]
    fn test_should_halt_session_loss() {
        let s = RiskSnapshot {
            session_pnl: dec!(-300.01),
            ..snapshot()
        };
        assert!(matches!(
            controller().should_halt(&s),
            Some(HaltReason::SessionLossLimit { .. })
        ));

        // Exactly at the limit does not trip
        let s = RiskSnapshot {
            session_pnl: dec!(-300),
            daily_pnl: dec!(-50),
            ..snapshot()
        };
        assert_eq!(controller().should_halt(&s), None);
    }

    #[test]
    fn test_should_halt_daily_loss() {
        let s = RiskSnapshot {
            daily_pnl: dec!(-100.5),
            ..snapshot()
        };
        assert!(matches!(
            controller().should_halt(&s),
            Some(HaltReason::DailyLossLimit { .. })
        ));
    }

    #[test]
    fn test_should_halt_low_balance() {
        let s = RiskSnapshot {
            balance: dec!(0.20),
            ..snapshot()
        };
        assert_eq!(
            controller().should_halt(&s),
            Some(HaltReason::InsufficientBalance {
                balance: dec!(0.20),
                min_stake: dec!(0.35)
            })
        );
    }

    #[test]
    fn test_win_rate() {
        assert_eq!(win_rate(&[]), (0.0, 0));
        assert_eq!(win_rate(&[Outcome::Win, Outcome::Loss]), (0.5, 2));
    }
}
