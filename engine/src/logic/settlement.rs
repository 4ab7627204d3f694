//! Agent settlement: wages, benefits, government purchases, interest,
//! education progress and bond flows.
//!
//! Day-start flows (first tick of each day): wage payment with tax
//! withholding, unemployment benefits, government goods purchases, education
//! progress for studying households, and bond seasoning/coupons per the
//! configured `bond_coupon_mode`. Per-tick flows: deposit and loan interest
//! accrual at the per-tick rate derived from the annual rate.
//!
//! All payer balances are tracked locally so no command can drive a balance
//! negative; underfunded payers pay what they can, in deterministic order.

use super::{hh_path, ModuleOutput, TickContext};
use crate::config::{BondCouponMode, SimulationConfig};
use crate::models::{TickDecisions, WorldState};
use serde_json::json;

const AMOUNT_EPS: f64 = 1e-9;

pub fn run(
    world: &WorldState,
    _decisions: &TickDecisions,
    config: &SimulationConfig,
    ctx: &TickContext,
) -> ModuleOutput {
    let mut out = ModuleOutput::new();
    let mut firm_cash = world.firm.cash;
    let mut gov_cash = world.government.cash;
    let mut wages_paid = 0.0;
    let mut taxes_collected = 0.0;
    let mut benefits_paid = 0.0;
    let mut gov_purchases = 0.0;
    let mut coupons_paid = 0.0;
    let mut redeemed = 0.0;

    if ctx.tick_in_day == 1 {
        let wage = world.firm.wage_offer;
        let tax_rate = world.government.tax_rate;

        // Firm payroll, in roster order.
        for id in &world.firm.employees {
            if !world.households.contains_key(id) {
                continue;
            }
            let paid = wage.min(firm_cash).max(0.0);
            if paid <= AMOUNT_EPS {
                out.assign(hh_path(id, "wage_income"), 0.0);
                continue;
            }
            let tax = paid * tax_rate;
            firm_cash -= paid;
            gov_cash += tax;
            taxes_collected += tax;
            wages_paid += paid;
            out.delta("firm.cash", -paid);
            out.delta(hh_path(id, "cash"), paid - tax);
            out.delta("government.cash", tax);
            out.assign(hh_path(id, "wage_income"), paid);
        }

        // Government payroll at the market wage; withheld tax nets out.
        for id in &world.government.employees {
            if !world.households.contains_key(id) {
                continue;
            }
            let paid = wage.min(gov_cash).max(0.0);
            if paid <= AMOUNT_EPS {
                out.assign(hh_path(id, "wage_income"), 0.0);
                continue;
            }
            let tax = paid * tax_rate;
            gov_cash -= paid - tax;
            taxes_collected += tax;
            wages_paid += paid;
            out.delta("government.cash", -(paid - tax));
            out.delta(hh_path(id, "cash"), paid - tax);
            out.assign(hh_path(id, "wage_income"), paid);
        }

        // Benefits and education for the rest.
        for (id, hh) in &world.households {
            if hh.employer_id.is_some() {
                continue;
            }
            out.assign(hh_path(id, "wage_income"), 0.0);
            let benefit = world.government.unemployment_benefit.min(gov_cash).max(0.0);
            if benefit > AMOUNT_EPS {
                gov_cash -= benefit;
                benefits_paid += benefit;
                out.delta("government.cash", -benefit);
                out.delta(hh_path(id, "cash"), benefit);
            }
            if hh.is_studying {
                let advanced =
                    (hh.education_level + config.education_daily_increment).min(1.5);
                out.assign(hh_path(id, "education_level"), advanced);
            }
        }

        // Government goods purchase against the firm's inventory.
        if world.firm.price > 0.0 {
            let budget = world.government.spending.min(gov_cash).max(0.0);
            let quantity = (budget / world.firm.price).min(world.firm.inventory);
            let value = quantity * world.firm.price;
            if value > AMOUNT_EPS {
                gov_cash -= value;
                firm_cash += value;
                gov_purchases = value;
                out.delta("government.cash", -value);
                out.delta("firm.cash", value);
                out.delta("firm.inventory", -quantity);
            }
        }

        // Bond seasoning and coupon/redemption flows.
        let daily_coupon = config.bond_coupon_rate / 365.0;
        match config.bond_coupon_mode {
            BondCouponMode::DailyAccrual => {
                // Season pending purchases, then pay the coupon on the
                // post-seasoning face value.
                for (id, hh) in &world.households {
                    let seasoned = hh.bond_holdings + hh.bonds_pending;
                    if hh.bonds_pending > AMOUNT_EPS {
                        out.assign(hh_path(id, "bond_holdings"), seasoned);
                        out.assign(hh_path(id, "bonds_pending"), 0.0);
                    }
                    let coupon = (seasoned * daily_coupon).min(gov_cash).max(0.0);
                    if coupon > AMOUNT_EPS {
                        gov_cash -= coupon;
                        coupons_paid += coupon;
                        out.delta("government.cash", -coupon);
                        out.delta(hh_path(id, "cash"), coupon);
                    }
                }
                let bank_seasoned = world.bank.bond_holdings + world.bank.bonds_pending;
                if world.bank.bonds_pending > AMOUNT_EPS {
                    out.assign("bank.bond_holdings", bank_seasoned);
                    out.assign("bank.bonds_pending", 0.0);
                }
                let coupon = (bank_seasoned * daily_coupon).min(gov_cash).max(0.0);
                if coupon > AMOUNT_EPS {
                    gov_cash -= coupon;
                    coupons_paid += coupon;
                    out.delta("government.cash", -coupon);
                    out.delta("bank.reserves", coupon);
                }
            }
            BondCouponMode::OnRedemption => {
                // Bonds held one full day redeem at face plus one day's
                // coupon; today's purchases season into holdings.
                for (id, hh) in &world.households {
                    let mut holdings = hh.bond_holdings;
                    if holdings > AMOUNT_EPS {
                        let affordable = gov_cash / (1.0 + daily_coupon);
                        let face = holdings.min(affordable).max(0.0);
                        if face > AMOUNT_EPS {
                            let payout = face * (1.0 + daily_coupon);
                            gov_cash -= payout;
                            redeemed += face;
                            coupons_paid += payout - face;
                            holdings -= face;
                            out.delta("government.cash", -payout);
                            out.delta("government.debt_outstanding", -face);
                            out.delta(hh_path(id, "cash"), payout);
                        }
                    }
                    out.assign(hh_path(id, "bond_holdings"), holdings + hh.bonds_pending);
                    if hh.bonds_pending > AMOUNT_EPS {
                        out.assign(hh_path(id, "bonds_pending"), 0.0);
                    }
                }
                let mut holdings = world.bank.bond_holdings;
                if holdings > AMOUNT_EPS {
                    let affordable = gov_cash / (1.0 + daily_coupon);
                    let face = holdings.min(affordable).max(0.0);
                    if face > AMOUNT_EPS {
                        let payout = face * (1.0 + daily_coupon);
                        gov_cash -= payout;
                        redeemed += face;
                        coupons_paid += payout - face;
                        holdings -= face;
                        out.delta("government.cash", -payout);
                        out.delta("government.debt_outstanding", -face);
                        out.delta("bank.reserves", payout);
                    }
                }
                out.assign("bank.bond_holdings", holdings + world.bank.bonds_pending);
                if world.bank.bonds_pending > AMOUNT_EPS {
                    out.assign("bank.bonds_pending", 0.0);
                }
            }
        }
    }

    // Per-tick interest accrual.
    let deposit_rate_tick = config.per_tick_rate(world.bank.deposit_rate);
    let loan_rate_tick = config.per_tick_rate(world.bank.loan_rate);
    let mut deposit_interest = 0.0;
    let mut loan_interest = 0.0;
    for (id, hh) in &world.households {
        if hh.deposits > AMOUNT_EPS {
            let interest = hh.deposits * deposit_rate_tick;
            deposit_interest += interest;
            out.delta(hh_path(id, "deposits"), interest);
            out.delta("bank.deposits", interest);
        }
        if hh.loans > AMOUNT_EPS {
            let interest = hh.loans * loan_rate_tick;
            loan_interest += interest;
            out.delta(hh_path(id, "loans"), interest);
            if world.bank.loans.contains_key(id) {
                out.delta(format!("bank.loans.{}", id), interest);
            }
        }
    }

    out.log(
        ctx,
        "agent_settlement",
        json!({
            "wages_paid": wages_paid,
            "taxes_collected": taxes_collected,
            "benefits_paid": benefits_paid,
            "government_purchases": gov_purchases,
            "coupons_paid": coupons_paid,
            "bonds_redeemed": redeemed,
            "deposit_interest": deposit_interest,
            "loan_interest": loan_interest,
        }),
    );
    let _ = firm_cash;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::testutil::{applied, ctx, fixture};
    use crate::models::{EmploymentStatus, FIRM_ID};

    fn employ(world: &mut WorldState, id: &str) {
        let hh = world.households.get_mut(id).unwrap();
        hh.employment_status = EmploymentStatus::EmployedFirm;
        hh.employer_id = Some(FIRM_ID.to_string());
        world.firm.employees.push(id.to_string());
    }

    #[test]
    fn wages_paid_with_tax_withholding_on_day_start() {
        let (mut world, decisions, config) = fixture(3);
        employ(&mut world, "000");

        let out = run(&world, &decisions, &config, &ctx(4, 3)); // tick_in_day == 1
        let updated = applied(&world, &out);

        let wage = world.firm.wage_offer;
        let tax = wage * world.government.tax_rate;
        assert!((updated.households["000"].cash - (100.0 + wage - tax)).abs() < 1e-9);
        assert_eq!(updated.households["000"].wage_income, wage);
        assert!((updated.firm.cash - (world.firm.cash - wage + expected_purchase(&world))).abs() < 1e-6);
    }

    fn expected_purchase(world: &WorldState) -> f64 {
        // Government buys spending/price units at the posted price.
        let qty = (world.government.spending / world.firm.price).min(world.firm.inventory);
        qty * world.firm.price
    }

    #[test]
    fn no_wage_flows_mid_day() {
        let (mut world, decisions, config) = fixture(3);
        employ(&mut world, "000");
        let out = run(&world, &decisions, &config, &ctx(2, 3));
        let updated = applied(&world, &out);
        assert_eq!(updated.households["000"].cash, 100.0);
    }

    #[test]
    fn unemployed_receive_benefit_and_zero_wage_income() {
        let (mut world, decisions, config) = fixture(3);
        world.households.get_mut("001").unwrap().wage_income = 7.0;
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert_eq!(updated.households["001"].wage_income, 0.0);
        assert!(
            (updated.households["001"].cash - (100.0 + world.government.unemployment_benefit))
                .abs()
                < 1e-9
        );
    }

    #[test]
    fn studying_household_advances_education() {
        let (mut world, decisions, config) = fixture(3);
        world.households.get_mut("000").unwrap().is_studying = true;
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert!(
            (updated.households["000"].education_level - config.education_daily_increment).abs()
                < 1e-9
        );
    }

    #[test]
    fn education_caps_at_max() {
        let (mut world, decisions, config) = fixture(3);
        {
            let hh = world.households.get_mut("000").unwrap();
            hh.is_studying = true;
            hh.education_level = 1.49;
        }
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert_eq!(updated.households["000"].education_level, 1.5);
    }

    #[test]
    fn deposit_interest_accrues_every_tick() {
        let (mut world, decisions, config) = fixture(3);
        world.households.get_mut("000").unwrap().deposits = 1_000.0;
        world.bank.deposits = 1_000.0;
        let out = run(&world, &decisions, &config, &ctx(2, 3));
        let updated = applied(&world, &out);
        let expected = 1_000.0 * config.per_tick_rate(world.bank.deposit_rate);
        assert!((updated.households["000"].deposits - 1_000.0 - expected).abs() < 1e-9);
        assert!((updated.bank.deposits - 1_000.0 - expected).abs() < 1e-9);
    }

    #[test]
    fn pending_bonds_season_at_day_start() {
        let (mut world, decisions, config) = fixture(3);
        {
            let hh = world.households.get_mut("000").unwrap();
            hh.bonds_pending = 10.0;
        }
        world.government.cash = 1_000.0;
        let out = run(&world, &decisions, &config, &ctx(4, 3));
        let updated = applied(&world, &out);
        assert_eq!(updated.households["000"].bond_holdings, 10.0);
        assert_eq!(updated.households["000"].bonds_pending, 0.0);
        // One day's coupon arrived in cash.
        let coupon = 10.0 * config.bond_coupon_rate / 365.0;
        assert!((updated.households["000"].cash - (100.0 + world.government.unemployment_benefit + coupon)).abs() < 1e-9);
    }

    #[test]
    fn on_redemption_mode_redeems_seasoned_bonds() {
        let (mut world, decisions, mut config) = fixture(3);
        config.bond_coupon_mode = BondCouponMode::OnRedemption;
        {
            let hh = world.households.get_mut("000").unwrap();
            hh.bond_holdings = 10.0; // seasoned: held a full day
            hh.bonds_pending = 5.0; // bought today
        }
        world.government.debt_outstanding = 15.0;
        let out = run(&world, &decisions, &config, &ctx(4, 3));
        let updated = applied(&world, &out);
        // Seasoned face redeemed, pending seasons into holdings.
        assert_eq!(updated.households["000"].bond_holdings, 5.0);
        assert_eq!(updated.households["000"].bonds_pending, 0.0);
        assert!((updated.government.debt_outstanding - 5.0).abs() < 1e-9);
    }
}
