// ===============================
// src/state.rs
// ===============================
//
// The auction aggregate and its store. The JS original kept one global
// mutable singleton and relied on single-threaded scheduling; here the
// aggregate sits behind a mutex and every mutation replaces its slice
// wholesale, publishing the matching event while the lock is held so
// subscription replay and live delivery cannot interleave.
//

use std::sync::{Arc, Mutex, MutexGuard};

use rand::RngCore;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{
    AgentTag, Approval, AuctionEvent, AuctionPhase, Bid, BidChannel, BidSource, BidStatus,
    BidUpdate, CatchRecord, Economics, Event, HarborOption, LogEntry, PendingDeal,
};
use crate::metrics::{BIDS, DEALS_SECURED};
use crate::stream::{EventBus, Subscription};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown bid: {0}")]
    UnknownBid(String),
    #[error("illegal bid transition {from:?} -> {to:?}")]
    IllegalTransition { from: BidStatus, to: BidStatus },
    #[error("no deal is pending approval")]
    NoPendingDeal,
    #[error("no active auction")]
    NoActiveAuction,
    #[error("auction is closed to new bids")]
    AuctionClosed,
}

#[derive(Debug, Default)]
pub struct AuctionState {
    pub phase: AuctionPhase,
    pub catch: Option<CatchRecord>,
    pub bids: Vec<Bid>,
    pub log: Vec<LogEntry>,
    pub countdown: u32,
    pub active_threads: u32,
    pub deadline: Option<String>,
    pub harbors: Vec<HarborOption>,
    pub recommended_harbor: Option<HarborOption>,
    pub economics: Option<Economics>,
    pub deal_approved: bool,
    pub pending_deal: Option<PendingDeal>,
    bid_seq: u64,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<AuctionState>>,
    bus: EventBus,
    rec_tx: Option<mpsc::Sender<Event>>,
}

impl Store {
    pub fn new(bus: EventBus, rec_tx: Option<mpsc::Sender<Event>>) -> Self {
        Self { inner: Arc::new(Mutex::new(AuctionState::default())), bus, rec_tx }
    }

    fn lock(&self) -> MutexGuard<'_, AuctionState> {
        // A poisoned lock only means a panicking writer; the state itself
        // is still consistent slice-wise.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, ev: AuctionEvent) {
        if let Some(tx) = &self.rec_tx {
            let _ = tx.try_send(Event::Auction(ev.clone()));
        }
        self.bus.publish(ev);
    }

    // ---- Gauges & phase ----

    pub fn phase(&self) -> AuctionPhase {
        self.lock().phase
    }

    pub fn set_phase(&self, phase: AuctionPhase) {
        let mut st = self.lock();
        st.phase = phase;
        self.publish(AuctionEvent::State { state: phase });
    }

    pub fn set_threads(&self, count: u32) {
        let mut st = self.lock();
        st.active_threads = count;
        self.publish(AuctionEvent::Threads { count });
    }

    pub fn set_countdown(&self, seconds: u32) {
        let mut st = self.lock();
        st.countdown = seconds;
        self.publish(AuctionEvent::Countdown { seconds });
    }

    /// One timer tick; stops at zero.
    pub fn tick_countdown(&self) -> u32 {
        let mut st = self.lock();
        if st.countdown > 0 {
            st.countdown -= 1;
            let seconds = st.countdown;
            self.publish(AuctionEvent::Countdown { seconds });
        }
        st.countdown
    }

    pub fn set_deadline(&self, deadline: String) {
        let mut st = self.lock();
        st.deadline = Some(deadline.clone());
        self.publish(AuctionEvent::Deadline { deadline });
    }

    pub fn set_harbors(&self, harbors: Vec<HarborOption>, recommended: HarborOption) {
        let mut st = self.lock();
        st.harbors = harbors.clone();
        st.recommended_harbor = Some(recommended.clone());
        self.publish(AuctionEvent::Harbors { harbors, recommended });
    }

    pub fn recommended_harbor(&self) -> Option<HarborOption> {
        self.lock().recommended_harbor.clone()
    }

    // ---- Catch ----

    pub fn set_catch(&self, catch: CatchRecord) {
        self.lock().catch = Some(catch);
    }

    pub fn catch(&self) -> Option<CatchRecord> {
        self.lock().catch.clone()
    }

    // ---- Log ----

    pub fn add_log(&self, agent: AgentTag, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry::new(agent, message);
        let mut st = self.lock();
        st.log.push(entry.clone());
        self.publish(AuctionEvent::Log { entry: entry.clone() });
        entry
    }

    pub fn log(&self) -> Vec<LogEntry> {
        self.lock().log.clone()
    }

    // ---- Bids ----

    pub fn next_bid_id(&self) -> String {
        let mut st = self.lock();
        st.bid_seq += 1;
        format!("bid-{}", st.bid_seq)
    }

    pub fn add_bid(&self, bid: Bid) {
        BIDS.with_label_values(&[
            bid.channel.as_str(),
            match bid.source {
                BidSource::Agent => "agent",
                BidSource::Human => "human",
            },
        ])
        .inc();
        let mut st = self.lock();
        st.bids.push(bid.clone());
        self.publish(AuctionEvent::Bid { bid });
    }

    pub fn bids(&self) -> Vec<Bid> {
        self.lock().bids.clone()
    }

    /// Latest still-ACTIVE bid from a buyer, if any.
    pub fn active_bid_of(&self, buyer_id: &str) -> Option<Bid> {
        self.lock()
            .bids
            .iter()
            .rev()
            .find(|b| b.buyer_id == buyer_id && b.status == BidStatus::Active)
            .cloned()
    }

    pub fn update_bid(&self, bid_id: &str, updates: BidUpdate) -> Result<(), StateError> {
        let mut st = self.lock();
        let bid = st
            .bids
            .iter_mut()
            .find(|b| b.id == bid_id)
            .ok_or_else(|| StateError::UnknownBid(bid_id.to_string()))?;

        if let Some(next) = updates.status {
            if !bid.status.can_transition(next) {
                return Err(StateError::IllegalTransition { from: bid.status, to: next });
            }
            bid.status = next;
        }
        if let Some(a) = updates.bid_amount {
            bid.bid_amount = a;
        }
        if let Some(g) = updates.gross_value {
            bid.gross_value = g;
        }
        if let Some(n) = updates.net_after_fuel {
            bid.net_after_fuel = n;
        }
        if let Some(act) = &updates.agent_action {
            bid.agent_action = act.clone();
        }
        if let Some(orig) = updates.original_amount {
            bid.original_amount = Some(orig);
        }
        self.publish(AuctionEvent::BidUpdate { bid_id: bid_id.to_string(), updates });
        Ok(())
    }

    /// External (human/buyer-UI/webhook) bid injection, merged into the
    /// same bid sequence as agent-generated bids.
    pub fn submit_external_bid(
        &self,
        buyer_id: &str,
        buyer_name: &str,
        amount_per_kg: f64,
        channel: BidChannel,
    ) -> Result<Bid, StateError> {
        let (weight, fuel, id) = {
            let mut st = self.lock();
            if st.phase.is_terminal() {
                return Err(StateError::AuctionClosed);
            }
            let catch = st.catch.as_ref().ok_or(StateError::NoActiveAuction)?;
            let weight = catch.weight_kg;
            let fuel = st.recommended_harbor.as_ref().map(|h| h.fuel_cost).unwrap_or(0);
            st.bid_seq += 1;
            (weight, fuel, format!("bid-{}", st.bid_seq))
        };

        let gross = amount_per_kg * weight;
        let bid = Bid {
            id,
            buyer_id: buyer_id.to_string(),
            buyer_name: buyer_name.to_string(),
            channel,
            source: BidSource::Human,
            bid_amount: amount_per_kg,
            gross_value: gross,
            net_after_fuel: gross - fuel as f64,
            agent_action: "Received".to_string(),
            status: BidStatus::Active,
            timestamp: crate::domain::ist_now(),
            original_amount: None,
        };
        self.add_bid(bid.clone());
        self.add_log(
            AgentTag::HumanBid,
            format!("{} bid \u{20B9}{:.0}/kg via {}", buyer_name, amount_per_kg, channel.as_str()),
        );
        Ok(bid)
    }

    // ---- Economics & pending deal ----

    pub fn set_economics(&self, data: Economics) {
        let mut st = self.lock();
        st.economics = Some(data);
        self.publish(AuctionEvent::Economics { data });
    }

    pub fn economics(&self) -> Option<Economics> {
        self.lock().economics
    }

    pub fn set_pending_deal(&self, deal: PendingDeal) {
        self.lock().pending_deal = Some(deal);
    }

    pub fn pending_deal(&self) -> Option<PendingDeal> {
        self.lock().pending_deal.clone()
    }

    /// Confirm the pending deal: the PROPOSED bid becomes ACCEPTED, the
    /// auction is DEAL_SECURED and the pending deal is cleared. `auto`
    /// marks the approval-window timeout path.
    pub fn approve_deal(&self, auto: bool) -> Result<Approval, StateError> {
        let (deal, bid_id) = {
            let mut st = self.lock();
            let deal = st.pending_deal.take().ok_or(StateError::NoPendingDeal)?;
            let bid_id = st
                .bids
                .iter()
                .find(|b| b.status == BidStatus::Proposed && b.buyer_id == deal.buyer_id)
                .map(|b| b.id.clone())
                .ok_or_else(|| StateError::UnknownBid(deal.buyer_id.clone()))?;
            st.deal_approved = true;
            (deal, bid_id)
        };

        self.update_bid(
            &bid_id,
            BidUpdate {
                status: Some(BidStatus::Accepted),
                agent_action: Some("ACCEPTED - Best net margin".to_string()),
                ..BidUpdate::default()
            },
        )?;
        self.set_phase(AuctionPhase::DealSecured);
        self.set_countdown(0);
        self.set_threads(0);

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let approval = Approval {
            approved: true,
            auto,
            approved_at: chrono::Utc::now().to_rfc3339(),
            buyer_id: deal.buyer_id.clone(),
            amount_per_kg: deal.amount_per_kg,
            approval_hash: format!("0x{}", hex::encode(nonce)),
        };
        DEALS_SECURED.inc();
        self.add_log(
            AgentTag::Auditor,
            if auto {
                format!(
                    "Approval window elapsed. Deal auto-confirmed with {} at \u{20B9}{:.0}/kg.",
                    deal.buyer_name, deal.amount_per_kg
                )
            } else {
                format!(
                    "Deal confirmed by fisherman: {} at \u{20B9}{:.0}/kg.",
                    deal.buyer_name, deal.amount_per_kg
                )
            },
        );
        Ok(approval)
    }

    pub fn deal_approved(&self) -> bool {
        self.lock().deal_approved
    }

    // ---- Reset & subscription ----

    /// Back to initial values, whatever came before. Idempotent.
    pub fn reset_auction(&self) {
        {
            let mut st = self.lock();
            *st = AuctionState::default();
        }
        self.publish(AuctionEvent::State { state: AuctionPhase::Idle });
        self.publish(AuctionEvent::Countdown { seconds: 0 });
        self.publish(AuctionEvent::Threads { count: 0 });
    }

    /// Replay-then-live: the lock makes the bid snapshot and the receiver
    /// creation atomic with respect to concurrent mutations.
    pub fn subscribe(&self) -> Subscription {
        let st = self.lock();
        let replay =
            st.bids.iter().map(|b| AuctionEvent::Bid { bid: b.clone() }).collect::<Vec<_>>();
        Subscription { replay, rx: self.bus.subscribe() }
    }

    /// (phase, has_catch, approved) for the status endpoint.
    pub fn status(&self) -> (AuctionPhase, bool, bool) {
        let st = self.lock();
        (st.phase, st.catch.is_some(), st.deal_approved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QualityGrade;

    fn store() -> Store {
        Store::new(EventBus::new(256), None)
    }

    fn sample_catch() -> CatchRecord {
        CatchRecord {
            species: "Pearl Spot".into(),
            species_local: "Karimeen".into(),
            weight_kg: 40.0,
            quality_grade: QualityGrade::A,
            quality_score: 94,
            freshness_hours: 2.0,
            catch_certificate_hash: "0xdeadbeef".into(),
        }
    }

    fn agent_bid(store: &Store, buyer_id: &str, amount: f64) -> Bid {
        let bid = Bid {
            id: store.next_bid_id(),
            buyer_id: buyer_id.into(),
            buyer_name: buyer_id.into(),
            channel: BidChannel::Whatsapp,
            source: BidSource::Agent,
            bid_amount: amount,
            gross_value: amount * 40.0,
            net_after_fuel: amount * 40.0 - 718.0,
            agent_action: "Evaluating...".into(),
            status: BidStatus::Active,
            timestamp: crate::domain::ist_now(),
            original_amount: None,
        };
        store.add_bid(bid.clone());
        bid
    }

    #[test]
    fn reset_is_idempotent_and_clears_everything() {
        let s = store();
        s.set_catch(sample_catch());
        s.set_phase(AuctionPhase::AuctionLive);
        s.set_threads(5);
        s.set_countdown(420);
        agent_bid(&s, "KFE", 410.0);
        s.add_log(AgentTag::Scout, "scanning");

        s.reset_auction();
        s.reset_auction();

        assert_eq!(s.phase(), AuctionPhase::Idle);
        assert!(s.bids().is_empty());
        assert!(s.log().is_empty());
        assert!(s.catch().is_none());
        let st = s.lock();
        assert_eq!(st.countdown, 0);
        assert_eq!(st.active_threads, 0);
    }

    #[test]
    fn bid_ids_restart_after_reset() {
        let s = store();
        assert_eq!(s.next_bid_id(), "bid-1");
        assert_eq!(s.next_bid_id(), "bid-2");
        s.reset_auction();
        assert_eq!(s.next_bid_id(), "bid-1");
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let s = store();
        let bid = agent_bid(&s, "KFE", 410.0);
        let err = s
            .update_bid(
                &bid.id,
                BidUpdate { status: Some(BidStatus::Accepted), ..BidUpdate::default() },
            )
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));

        // ACTIVE -> PROPOSED -> ACCEPTED is the only accepting path.
        s.update_bid(&bid.id, BidUpdate { status: Some(BidStatus::Proposed), ..Default::default() })
            .unwrap();
        s.update_bid(&bid.id, BidUpdate { status: Some(BidStatus::Accepted), ..Default::default() })
            .unwrap();
    }

    #[test]
    fn update_unknown_bid_errors() {
        let s = store();
        let err = s.update_bid("bid-99", BidUpdate::default()).unwrap_err();
        assert!(matches!(err, StateError::UnknownBid(_)));
    }

    #[test]
    fn approve_without_pending_deal_errors() {
        let s = store();
        assert!(matches!(s.approve_deal(false), Err(StateError::NoPendingDeal)));
    }

    #[test]
    fn approve_accepts_proposed_bid_and_secures_deal() {
        let s = store();
        s.set_catch(sample_catch());
        let bid = agent_bid(&s, "MWS", 445.0);
        s.update_bid(&bid.id, BidUpdate { status: Some(BidStatus::Proposed), ..Default::default() })
            .unwrap();
        s.set_pending_deal(PendingDeal {
            buyer_id: "MWS".into(),
            buyer_name: "Marina Wholesale Seafood".into(),
            amount_per_kg: 445.0,
            proposed_at: chrono::Utc::now(),
            window_secs: 120,
        });

        let approval = s.approve_deal(true).unwrap();
        assert!(approval.auto);
        assert!(approval.approval_hash.starts_with("0x"));
        assert_eq!(s.phase(), AuctionPhase::DealSecured);
        assert!(s.pending_deal().is_none());
        assert_eq!(s.bids()[0].status, BidStatus::Accepted);
        // Second approval on the same auction has nothing pending.
        assert!(matches!(s.approve_deal(false), Err(StateError::NoPendingDeal)));
    }

    #[test]
    fn external_bid_requires_catch_and_open_auction() {
        let s = store();
        assert!(matches!(
            s.submit_external_bid("B1", "Buyer", 400.0, BidChannel::Ui),
            Err(StateError::NoActiveAuction)
        ));

        s.set_catch(sample_catch());
        s.set_phase(AuctionPhase::AuctionLive);
        let bid = s.submit_external_bid("B1", "Buyer", 400.0, BidChannel::Ui).unwrap();
        assert_eq!(bid.source, BidSource::Human);
        assert_eq!(bid.gross_value, 16_000.0);

        s.set_phase(AuctionPhase::Liquidation);
        assert!(matches!(
            s.submit_external_bid("B2", "Late Buyer", 500.0, BidChannel::Ui),
            Err(StateError::AuctionClosed)
        ));
    }

    #[tokio::test]
    async fn subscription_replays_bids_before_new_events() {
        let s = store();
        s.set_catch(sample_catch());
        agent_bid(&s, "KFE", 410.0);
        agent_bid(&s, "MWS", 445.0);

        let mut sub = s.subscribe();
        assert_eq!(sub.replay.len(), 2);
        match (&sub.replay[0], &sub.replay[1]) {
            (AuctionEvent::Bid { bid: a }, AuctionEvent::Bid { bid: b }) => {
                assert_eq!(a.id, "bid-1");
                assert_eq!(b.id, "bid-2");
            }
            other => panic!("unexpected replay {other:?}"),
        }

        agent_bid(&s, "GGE", 455.0);
        match sub.rx.recv().await.unwrap() {
            AuctionEvent::Bid { bid } => assert_eq!(bid.id, "bid-3"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
