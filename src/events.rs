// 11.0: every state change the engine commits produces an event. amounts are native
// units of the asset named by the market. the EventPayload enum lists all event types.

use crate::liquidation::LiquidationOutcome;
use crate::types::{BandIndex, Direction, MarketId, Timestamp, UserId};
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }

    pub fn market_id(&self) -> Option<MarketId> {
        use EventPayload::*;
        match &self.payload {
            MarketCreated(e) => Some(e.market_id),
            Supplied(e) | SupplyWithdrawn(e) => Some(e.market_id),
            LoanCreated(e) | CollateralAdded(e) | CollateralRemoved(e) | BorrowedMore(e) => Some(e.market_id),
            Repaid(e) => Some(e.market_id),
            Exchange(e) => Some(e.market_id),
            Liquidated(e) => Some(e.market_id),
            FeesCollected(e) => Some(e.market_id),
            TransitionRejected(e) => e.market_id,
            Minted(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    // Market events
    MarketCreated(MarketCreatedEvent),
    FeesCollected(FeesCollectedEvent),

    // Wallet events
    Minted(MintedEvent),

    // Lender events
    Supplied(SupplyEvent),
    SupplyWithdrawn(SupplyEvent),

    // Loan events
    LoanCreated(LoanEvent),
    CollateralAdded(LoanEvent),
    CollateralRemoved(LoanEvent),
    BorrowedMore(LoanEvent),
    Repaid(RepaidEvent),

    // AMM events
    Exchange(ExchangeEvent),

    // Risk events
    Liquidated(LiquidatedEvent),

    // Audit events
    TransitionRejected(TransitionRejectedEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketCreatedEvent {
    pub market_id: MarketId,
    pub name: String,
    pub base_price: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeesCollectedEvent {
    pub market_id: MarketId,
    pub amount: U256,
    pub total_issued: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintedEvent {
    pub user: UserId,
    pub symbol: String,
    pub amount: U256,
    pub new_balance: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyEvent {
    pub market_id: MarketId,
    pub user: UserId,
    pub amount: U256,
    pub available: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanEvent {
    pub market_id: MarketId,
    pub owner: UserId,
    // Collateral moved in this step, not the position total
    pub collateral_delta: U256,
    pub debt_delta: U256,
    pub debt: U256,
    pub n1: BandIndex,
    pub n2: BandIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaidEvent {
    pub market_id: MarketId,
    pub owner: UserId,
    pub amount: U256,
    pub remaining_debt: U256,
    pub collateral_returned: U256,
    pub borrowed_returned: U256,
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeEvent {
    pub market_id: MarketId,
    pub trader: UserId,
    pub direction: Direction,
    pub amount_in: U256,
    pub amount_out: U256,
    pub active_band: BandIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidatedEvent {
    pub market_id: MarketId,
    pub owner: UserId,
    pub liquidator: UserId,
    pub outcome: LiquidationOutcome,
    pub debt_repaid: U256,
    pub collateral_out: U256,
    pub liquidator_paid: U256,
    pub borrower_refund: U256,
}

// Recorded for failed engine calls. state is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRejectedEvent {
    pub market_id: Option<MarketId>,
    pub user: UserId,
    pub operation: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liquidation_event_round_trip() {
        let event = Event::new(
            EventId(7),
            Timestamp::from_secs(86_400),
            EventPayload::Liquidated(LiquidatedEvent {
                market_id: MarketId(1),
                owner: UserId(42),
                liquidator: UserId(99),
                outcome: LiquidationOutcome::Repaired,
                debt_repaid: U256::from(1_500u64),
                collateral_out: U256::from(2u64),
                liquidator_paid: U256::from(1_500u64),
                borrower_refund: U256::ZERO,
            }),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
        assert_eq!(back.market_id(), Some(MarketId(1)));
    }

    #[test]
    fn mint_has_no_market() {
        let event = Event::new(
            EventId(1),
            Timestamp::ZERO,
            EventPayload::Minted(MintedEvent {
                user: UserId(1),
                symbol: "crvUSD".to_string(),
                amount: U256::from(10u64),
                new_balance: U256::from(10u64),
            }),
        );
        assert_eq!(event.market_id(), None);
    }
}
