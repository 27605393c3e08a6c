//! Server-side media peer
//!
//! A [`MediaPeer`] wraps one [`MediaSession`] and serializes every
//! signaling step on it. Renegotiation requested while an offer/answer
//! exchange is still open is remembered and replayed once the session is
//! back in a stable state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::error::Result;
use crate::session::MediaSession;
use crate::signal::{IceCandidate, SessionDescription, Signal, SignalSender};
use crate::types::PeerId;

pub struct MediaPeer {
    id: PeerId,
    session: Arc<dyn MediaSession>,
    signals: SignalSender,
    negotiation: Mutex<()>,
    pending_negotiation: AtomicBool,
    closed: AtomicBool,
    /// Stops the task draining this peer's session events
    shutdown: CancellationToken,
}

impl std::fmt::Debug for MediaPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPeer")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MediaPeer {
    pub(crate) fn new(id: PeerId, session: Arc<dyn MediaSession>, signals: SignalSender) -> Self {
        Self {
            id,
            session,
            signals,
            negotiation: Mutex::new(()),
            pending_negotiation: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    /// Apply a client offer and send back the answer
    pub async fn handle_offer(&self, offer: SessionDescription) -> Result<()> {
        {
            let _guard = self.negotiation.lock().await;
            self.session.set_remote_description(offer).await?;
            let answer = self.session.create_answer().await?;
            self.emit(answer);
        }
        self.flush_pending().await
    }

    /// Apply the client's answer to a server-initiated offer
    pub async fn handle_answer(&self, answer: SessionDescription) -> Result<()> {
        {
            let _guard = self.negotiation.lock().await;
            self.session.set_remote_description(answer).await?;
        }
        self.flush_pending().await
    }

    pub async fn handle_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let _guard = self.negotiation.lock().await;
        self.session.add_ice_candidate(candidate).await
    }

    /// Attach a forwarded mirror; the caller follows up with [`negotiate`](Self::negotiate)
    pub async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<()> {
        let _guard = self.negotiation.lock().await;
        self.session.add_track(track).await
    }

    /// Send a fresh offer, or defer it until the current exchange settles
    pub async fn negotiate(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let _guard = self.negotiation.lock().await;
        if !self.session.can_offer().await {
            debug!(peer_id = %self.id, "Negotiation deferred");
            self.pending_negotiation.store(true, Ordering::SeqCst);
            return Ok(());
        }

        self.pending_negotiation.store(false, Ordering::SeqCst);
        let offer = self.session.create_offer().await?;
        self.emit(offer);
        Ok(())
    }

    async fn flush_pending(&self) -> Result<()> {
        if self.pending_negotiation.swap(false, Ordering::SeqCst) {
            self.negotiate().await
        } else {
            Ok(())
        }
    }

    /// Whether this peer signals through `sender`'s channel
    #[must_use]
    pub fn signals_to(&self, sender: &SignalSender) -> bool {
        self.signals.same_channel(sender)
    }

    pub(crate) fn send_candidate(&self, candidate: IceCandidate) {
        self.signals.send(Signal::Candidate(candidate));
    }

    fn emit(&self, desc: SessionDescription) {
        if let Some(signal) = desc.into_signal() {
            self.signals.send(signal);
        }
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session; later calls are no-ops
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        if let Err(e) = self.session.close().await {
            warn!(peer_id = %self.id, error = %e, "Failed to close media session");
        }
        debug!(peer_id = %self.id, "Media peer closed");
    }
}

impl Drop for MediaPeer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        debug!(peer_id = %self.id, "Media peer dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeSession;
    use tokio::sync::mpsc;

    fn peer() -> (MediaPeer, Arc<FakeSession>, mpsc::Receiver<Signal>) {
        let session = Arc::new(FakeSession::default());
        let (signals, rx) = SignalSender::channel(PeerId::from("p1"), 16);
        let peer = MediaPeer::new(PeerId::from("p1"), session.clone(), signals);
        (peer, session, rx)
    }

    #[tokio::test]
    async fn test_offer_produces_answer() {
        let (peer, _session, mut rx) = peer();

        peer.handle_offer(SessionDescription::offer("client-offer"))
            .await
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            Signal::Answer {
                sdp: "fake-answer".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_offer_is_reported() {
        let (peer, _session, mut rx) = peer();

        assert!(peer.handle_offer(SessionDescription::offer("")).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_negotiation_waits_for_remote_description() {
        let (peer, session, mut rx) = peer();

        peer.negotiate().await.unwrap();
        assert!(rx.try_recv().is_err());

        peer.handle_offer(SessionDescription::offer("client-offer"))
            .await
            .unwrap();

        assert!(matches!(rx.try_recv().unwrap(), Signal::Answer { .. }));
        assert!(matches!(rx.try_recv().unwrap(), Signal::Offer { .. }));
        assert_eq!(session.offers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negotiation_during_outstanding_offer_is_replayed_after_answer() {
        let (peer, session, mut rx) = peer();
        peer.handle_offer(SessionDescription::offer("client-offer"))
            .await
            .unwrap();
        rx.try_recv().unwrap();

        peer.negotiate().await.unwrap();
        peer.negotiate().await.unwrap();
        assert_eq!(session.offers.load(Ordering::SeqCst), 1);

        peer.handle_answer(SessionDescription::answer("client-answer"))
            .await
            .unwrap();
        assert_eq!(session.offers.load(Ordering::SeqCst), 2);
        assert!(matches!(rx.try_recv().unwrap(), Signal::Offer { .. }));
        assert!(matches!(rx.try_recv().unwrap(), Signal::Offer { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (peer, session, _rx) = peer();

        peer.close().await;
        peer.close().await;

        assert!(peer.is_closed());
        assert!(session.is_closed());
        assert!(peer.shutdown_token().is_cancelled());
        peer.negotiate().await.unwrap();
        assert_eq!(session.offers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_signals_after_connection_gone_are_dropped() {
        let (peer, _session, rx) = peer();
        drop(rx);

        peer.handle_offer(SessionDescription::offer("client-offer"))
            .await
            .unwrap();
    }
}
