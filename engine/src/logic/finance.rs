//! Finance market clearing. Runs every tick in a fixed internal order:
//! withdrawals, then deposits, then loan approvals, then the bond auction.
//!
//! Loan gate: when the bank's reserves are below `reserve_ratio * deposits`
//! no new loans are approved this tick. Individual requests are rejected
//! when the bid rate is below the bank's posted rate or when the
//! collateral/income score falls under 0.3. Accepted loans reduce reserves.
//!
//! Bond auction: all bids are shuffled deterministically under the seeded
//! stream and filled sequentially until the issuance volume is exhausted;
//! the last bid may fill partially, and no bid is ever overfilled.

use super::{hh_path, ModuleOutput, TickContext};
use crate::config::SimulationConfig;
use crate::models::{TickDecisions, WorldState};
use crate::rng::RngManager;
use serde_json::json;

const AMOUNT_EPS: f64 = 1e-9;
/// Minimum collateral/income score for loan approval.
const LOAN_SCORE_FLOOR: f64 = 0.3;

/// Creditworthiness in `[0, 1]`: liquid collateral plus a multiple of wage
/// income, relative to post-approval debt.
fn loan_score(
    cash: f64,
    deposits: f64,
    bonds: f64,
    wage_income: f64,
    outstanding: f64,
    requested: f64,
) -> f64 {
    let collateral = deposits + bonds + 0.5 * cash;
    let exposure = outstanding + requested;
    if exposure <= 0.0 {
        return 1.0;
    }
    ((collateral + 4.0 * wage_income) / exposure).min(1.0)
}

enum BondBidder {
    Bank,
    Household(String),
}

pub fn run(
    world: &WorldState,
    decisions: &TickDecisions,
    _config: &SimulationConfig,
    ctx: &TickContext,
) -> ModuleOutput {
    let mut out = ModuleOutput::new();

    // Running balances so each phase sees the previous phase's effects.
    let mut bank_reserves = world.bank.reserves;
    let mut bank_deposits = world.bank.deposits;
    let mut cash: std::collections::BTreeMap<&String, f64> =
        world.households.iter().map(|(id, hh)| (id, hh.cash)).collect();

    // Phase 1: withdrawals.
    let mut total_withdrawn = 0.0;
    for (id, hh) in &world.households {
        let requested = decisions.households[id].withdrawal_amount;
        let amount = requested.min(hh.deposits).min(bank_reserves).max(0.0);
        if amount > AMOUNT_EPS {
            out.delta(hh_path(id, "deposits"), -amount);
            out.delta(hh_path(id, "cash"), amount);
            out.delta("bank.deposits", -amount);
            out.delta("bank.reserves", -amount);
            bank_reserves -= amount;
            bank_deposits -= amount;
            *cash.get_mut(id).expect("household exists") += amount;
            total_withdrawn += amount;
        }
    }

    // Phase 2: deposits.
    let mut total_deposited = 0.0;
    for (id, _) in &world.households {
        let available = *cash.get(id).expect("household exists");
        let amount = decisions.households[id].deposit_amount.min(available).max(0.0);
        if amount > AMOUNT_EPS {
            out.delta(hh_path(id, "cash"), -amount);
            out.delta(hh_path(id, "deposits"), amount);
            out.delta("bank.deposits", amount);
            out.delta("bank.reserves", amount);
            bank_reserves += amount;
            bank_deposits += amount;
            *cash.get_mut(id).expect("household exists") -= amount;
            total_deposited += amount;
        }
    }

    // Phase 3: loan approvals.
    let reserve_ratio = world.central_bank.reserve_ratio;
    let required_reserves = reserve_ratio * bank_deposits;
    let reserves_adequate = bank_reserves + AMOUNT_EPS >= required_reserves;
    let mut loans_approved = Vec::new();
    let mut loans_rejected = Vec::new();
    if reserves_adequate {
        for (id, hh) in &world.households {
            let decision = &decisions.households[id];
            let requested = decision.loan_request;
            if requested <= AMOUNT_EPS {
                continue;
            }
            if decision.loan_rate_bid < world.bank.loan_rate {
                loans_rejected.push(json!({ "id": id, "reason": "rate_below_posted" }));
                continue;
            }
            let score = loan_score(
                *cash.get(id).expect("household exists"),
                hh.deposits,
                hh.bond_holdings,
                hh.wage_income,
                hh.loans,
                requested,
            );
            if score < LOAN_SCORE_FLOOR {
                loans_rejected.push(json!({ "id": id, "reason": "score_below_floor", "score": score }));
                continue;
            }
            // Disbursing may not push reserves under the requirement.
            if bank_reserves - requested + AMOUNT_EPS < required_reserves {
                loans_rejected.push(json!({ "id": id, "reason": "reserves_exhausted" }));
                continue;
            }
            let outstanding = world.bank.loans.get(id).copied().unwrap_or(0.0);
            out.delta(hh_path(id, "cash"), requested);
            out.delta(hh_path(id, "loans"), requested);
            out.assign(format!("bank.loans.{}", id), outstanding + requested);
            out.delta("bank.reserves", -requested);
            bank_reserves -= requested;
            *cash.get_mut(id).expect("household exists") += requested;
            loans_approved.push(json!({ "id": id, "amount": requested, "score": score }));
        }
    }

    // Phase 4: bond auction.
    let issuance = decisions.government.bond_issuance;
    let mut issued = 0.0;
    let mut auction_fills = Vec::new();
    if issuance > AMOUNT_EPS {
        let mut bids: Vec<(BondBidder, f64)> = Vec::new();
        let bank_capacity = (bank_reserves - required_reserves).max(0.0);
        let bank_bid = decisions.bank.bond_bid_face.min(bank_capacity);
        if bank_bid > AMOUNT_EPS {
            bids.push((BondBidder::Bank, bank_bid));
        }
        for (id, _) in &world.households {
            let bid = decisions.households[id]
                .bond_bid_face
                .min(*cash.get(id).expect("household exists"));
            if bid > AMOUNT_EPS {
                bids.push((BondBidder::Household(id.clone()), bid));
            }
        }

        let mut rng = RngManager::for_purpose(ctx.seed, ctx.tick_index, "bond_auction");
        rng.shuffle(&mut bids);

        let mut remaining = issuance;
        for (bidder, face) in bids {
            if remaining <= AMOUNT_EPS {
                break;
            }
            let fill = face.min(remaining);
            remaining -= fill;
            issued += fill;
            match bidder {
                BondBidder::Bank => {
                    out.delta("bank.reserves", -fill);
                    out.delta("bank.bonds_pending", fill);
                    bank_reserves -= fill;
                    auction_fills.push(json!({ "bidder": "bank", "face": fill }));
                }
                BondBidder::Household(id) => {
                    out.delta(hh_path(&id, "cash"), -fill);
                    out.delta(hh_path(&id, "bonds_pending"), fill);
                    *cash.get_mut(&id).expect("household exists") -= fill;
                    auction_fills.push(json!({ "bidder": id, "face": fill }));
                }
            }
        }
        if issued > AMOUNT_EPS {
            out.delta("government.cash", issued);
            out.delta("government.debt_outstanding", issued);
        }
    }

    out.log(
        ctx,
        "finance_market",
        json!({
            "withdrawn": total_withdrawn,
            "deposited": total_deposited,
            "reserves_adequate": reserves_adequate,
            "loans_approved": loans_approved,
            "loans_rejected": loans_rejected,
            "bond_issuance": issuance,
            "bonds_issued": issued,
            "auction_fills": auction_fills,
        }),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::testutil::{applied, ctx, fixture};

    #[test]
    fn withdrawals_precede_deposits() {
        let (mut world, mut decisions, config) = fixture(3);
        {
            let hh = world.households.get_mut("000").unwrap();
            hh.deposits = 50.0;
        }
        world.bank.deposits = 50.0;
        for d in decisions.households.values_mut() {
            d.deposit_amount = 0.0;
            d.withdrawal_amount = 0.0;
        }
        decisions.households.get_mut("000").unwrap().withdrawal_amount = 30.0;
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert!((updated.households["000"].deposits - 20.0).abs() < 1e-9);
        assert!((updated.households["000"].cash - 130.0).abs() < 1e-9);
        assert!((updated.bank.deposits - 20.0).abs() < 1e-9);
        updated.check_invariants(3).unwrap();
    }

    #[test]
    fn low_rate_bid_is_rejected() {
        let (world, mut decisions, config) = fixture(3);
        {
            let d = decisions.households.get_mut("000").unwrap();
            d.loan_request = 10.0;
            d.loan_rate_bid = 0.0; // below the posted rate
        }
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert_eq!(updated.households["000"].loans, 0.0);
        let log = &out.logs[0];
        assert_eq!(log.context["loans_rejected"][0]["reason"], "rate_below_posted");
    }

    #[test]
    fn approved_loan_reduces_reserves() {
        let (mut world, mut decisions, config) = fixture(3);
        {
            let hh = world.households.get_mut("000").unwrap();
            hh.deposits = 100.0;
            hh.wage_income = 20.0;
        }
        world.bank.deposits = 100.0;
        for d in decisions.households.values_mut() {
            d.deposit_amount = 0.0;
            d.withdrawal_amount = 0.0;
        }
        {
            let d = decisions.households.get_mut("000").unwrap();
            d.loan_request = 50.0;
            d.loan_rate_bid = 1.0;
        }
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let updated = applied(&world, &out);
        assert!((updated.households["000"].loans - 50.0).abs() < 1e-9);
        assert!((updated.bank.reserves - (world.bank.reserves - 50.0)).abs() < 1e-9);
        assert_eq!(updated.bank.loans["000"], 50.0);
    }

    #[test]
    fn no_loans_when_reserves_below_requirement() {
        let (mut world, mut decisions, config) = fixture(3);
        world.bank.reserves = 1.0;
        world.bank.deposits = 1_000.0;
        for (id, hh) in world.households.iter_mut() {
            hh.deposits = 1_000.0 / 3.0;
            let d = decisions.households.get_mut(id).unwrap();
            d.loan_request = 10.0;
            d.loan_rate_bid = 1.0;
            d.deposit_amount = 0.0;
            d.withdrawal_amount = 0.0;
        }
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let log = &out.logs[0];
        assert_eq!(log.context["reserves_adequate"], false);
        assert!(log.context["loans_approved"].as_array().unwrap().is_empty());
    }

    #[test]
    fn bond_auction_partial_fill_never_overfills() {
        let (world, mut decisions, config) = fixture(3);
        decisions.government.bond_issuance = 40.0;
        decisions.bank.bond_bid_face = 30.0;
        for d in decisions.households.values_mut() {
            d.bond_bid_face = 25.0;
        }
        let out = run(&world, &decisions, &config, &ctx(1, 3));
        let log = &out.logs[0];
        let issued = log.context["bonds_issued"].as_f64().unwrap();
        assert!((issued - 40.0).abs() < 1e-9);
        let fills = log.context["auction_fills"].as_array().unwrap();
        let total: f64 = fills.iter().map(|f| f["face"].as_f64().unwrap()).sum();
        assert!((total - 40.0).abs() < 1e-9);
        // No single fill exceeds its bid.
        for fill in fills {
            assert!(fill["face"].as_f64().unwrap() <= 30.0 + 1e-9);
        }
        let updated = applied(&world, &out);
        assert!((updated.government.debt_outstanding - 40.0).abs() < 1e-9);
    }

    #[test]
    fn auction_shuffle_is_deterministic() {
        let (world, mut decisions, config) = fixture(3);
        decisions.government.bond_issuance = 10.0;
        for d in decisions.households.values_mut() {
            d.bond_bid_face = 8.0;
        }
        let a = run(&world, &decisions, &config, &ctx(1, 3));
        let b = run(&world, &decisions, &config, &ctx(1, 3));
        assert_eq!(a.commands, b.commands);
    }
}
