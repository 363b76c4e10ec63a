use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use jukebox_core::{now_ms, StateStoreExt, StoreError};

use crate::{
    events::RoomEvent, CollabContext, DjError, DjReason, DjStateMachine, PrimaryKey, Room,
    RoomError,
};

/// Guards against float representation error when computing the required
/// ballot count from a threshold share.
const THRESHOLD_EPSILON: f64 = 1e-9;

/// How many cross-instance CAS races are tolerated before giving up
const CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    DjElection,
    Mutiny,
}

/// A single ballot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VoteChoice {
    /// Mutiny ballots: yes or no
    Approve(bool),
    /// Election ballots: the member the voter wants as DJ
    Candidate(PrimaryKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    Pending,
    Passed,
    Failed,
    Cancelled,
}

/// A voter captured in the eligibility snapshot at open time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EligibleVoter {
    pub user_id: PrimaryKey,
    /// Kept for election tie-breaks
    pub joined_at: DateTime<Utc>,
}

/// One election or mutiny. The eligible set is immutable once opened; at most
/// one pending session exists per room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteSession {
    pub id: Uuid,
    pub room_id: PrimaryKey,
    pub kind: VoteKind,
    pub initiator: PrimaryKey,
    /// Mutinies: the DJ the vote is against
    pub target: Option<PrimaryKey>,
    pub threshold: f64,
    pub eligible: Vec<EligibleVoter>,
    pub ballots: BTreeMap<PrimaryKey, VoteChoice>,
    pub opened_at_ms: i64,
    pub outcome: VoteOutcome,
}

/// What a re-evaluation concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pending,
    Passed { winner: Option<PrimaryKey> },
    Failed,
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("No vote is in progress")]
    NoPendingVote,
    #[error("Another vote is already in progress")]
    VoteInProgress,
    #[error("Voter is not in the eligible set")]
    NotEligible,
    #[error("Voter has already cast a ballot")]
    AlreadyVoted,
    #[error("Ballot does not fit this vote")]
    InvalidChoice,
    #[error("A room needs at least two members to elect a DJ")]
    NeedsMoreMembers,
    #[error("Room has no DJ to mutiny against")]
    NoDjToMutiny,
    #[error("The DJ cannot start a mutiny against themselves")]
    DjCannotMutiny,
    #[error("A failed mutiny against this DJ is still cooling down")]
    MutinyCooldown,
    #[error("The vote state changed concurrently, try again")]
    Contention,
    #[error(transparent)]
    Room(RoomError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Dj(DjError),
}

impl VoteSession {
    fn new(
        room: &Arc<Room>,
        kind: VoteKind,
        initiator: PrimaryKey,
        target: Option<PrimaryKey>,
        eligible: Vec<EligibleVoter>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: room.id(),
            kind,
            initiator,
            target,
            threshold: room.settings().mutiny_threshold,
            eligible,
            ballots: BTreeMap::new(),
            opened_at_ms: now_ms(),
            outcome: VoteOutcome::Pending,
        }
    }

    pub fn is_eligible(&self, user_id: PrimaryKey) -> bool {
        self.eligible.iter().any(|v| v.user_id == user_id)
    }

    pub fn has_voted(&self, user_id: PrimaryKey) -> bool {
        self.ballots.contains_key(&user_id)
    }

    pub fn yes_count(&self) -> usize {
        self.ballots
            .values()
            .filter(|c| matches!(c, VoteChoice::Approve(true)))
            .count()
    }

    pub fn no_count(&self) -> usize {
        self.ballots
            .values()
            .filter(|c| matches!(c, VoteChoice::Approve(false)))
            .count()
    }

    /// How many yes ballots the threshold demands over the eligible set
    pub fn required_yes(&self) -> usize {
        ((self.threshold * self.eligible.len() as f64) - THRESHOLD_EPSILON).ceil() as usize
    }

    fn remaining_unvoted(&self) -> usize {
        self.eligible.len() - self.ballots.len()
    }

    /// The candidate with the most ballots, ties broken by earliest join
    fn leading_candidate(&self) -> Option<PrimaryKey> {
        let mut tallies: BTreeMap<PrimaryKey, usize> = BTreeMap::new();

        for choice in self.ballots.values() {
            if let VoteChoice::Candidate(candidate) = choice {
                *tallies.entry(*candidate).or_default() += 1;
            }
        }

        tallies
            .into_iter()
            .max_by(|(a_id, a_count), (b_id, b_count)| {
                a_count
                    .cmp(b_count)
                    .then_with(|| self.joined_at(*b_id).cmp(&self.joined_at(*a_id)))
            })
            .map(|(candidate, _)| candidate)
    }

    fn joined_at(&self, user_id: PrimaryKey) -> Option<DateTime<Utc>> {
        self.eligible
            .iter()
            .find(|v| v.user_id == user_id)
            .map(|v| v.joined_at)
    }

    /// The re-evaluation run after every ballot and at timeout.
    fn evaluate(&self, timed_out: bool) -> Verdict {
        match self.kind {
            VoteKind::Mutiny => {
                let required = self.required_yes();

                if self.yes_count() >= required {
                    Verdict::Passed { winner: None }
                } else if timed_out
                    || self.yes_count() + self.remaining_unvoted() < required
                    || self.remaining_unvoted() == 0
                {
                    Verdict::Failed
                } else {
                    Verdict::Pending
                }
            }
            VoteKind::DjElection => {
                if self.remaining_unvoted() == 0 || timed_out {
                    match self.leading_candidate() {
                        Some(winner) => Verdict::Passed {
                            winner: Some(winner),
                        },
                        None => Verdict::Failed,
                    }
                } else {
                    Verdict::Pending
                }
            }
        }
    }
}

/// Runs DJ elections and mutinies over one shared state machine:
/// `idle -> open -> passed | failed | cancelled`.
pub struct VoteEngine {
    me: Weak<Self>,
    context: CollabContext,
    dj: Arc<DjStateMachine>,
}

impl VoteEngine {
    pub fn new(context: &CollabContext, dj: Arc<DjStateMachine>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            context: context.clone(),
            dj,
        })
    }

    /// Opens an election for the DJ slot. Any member may start one.
    pub async fn open_election(
        &self,
        room: &Arc<Room>,
        initiator: PrimaryKey,
    ) -> Result<VoteSession, VoteError> {
        let _guard = room.lock().await;

        room.ensure_active().map_err(VoteError::Room)?;
        room.member_by_user_id(initiator).map_err(VoteError::Room)?;

        if room.member_count() < 2 {
            return Err(VoteError::NeedsMoreMembers);
        }

        let eligible = snapshot_voters(room, None);
        let session = VoteSession::new(room, VoteKind::DjElection, initiator, None, eligible);

        self.insert_session(room, &session).await?;

        info!("Election {} opened in room {}", session.id, room.data().name);

        self.context.emit(
            room.id(),
            RoomEvent::ElectionStarted {
                room_id: room.id(),
                session: session.clone(),
            },
        );

        self.spawn_timeout(room, session.id);

        Ok(session)
    }

    /// Opens a mutiny against the current DJ. Any member but the DJ may
    /// start one, unless a failed mutiny against the same DJ is cooling down.
    pub async fn open_mutiny(
        &self,
        room: &Arc<Room>,
        initiator: PrimaryKey,
    ) -> Result<VoteSession, VoteError> {
        let _guard = room.lock().await;

        room.ensure_active().map_err(VoteError::Room)?;
        room.member_by_user_id(initiator).map_err(VoteError::Room)?;

        let dj = self
            .dj
            .current_dj(room)
            .await
            .map_err(VoteError::Dj)?
            .ok_or(VoteError::NoDjToMutiny)?;

        if dj.user_id == initiator {
            return Err(VoteError::DjCannotMutiny);
        }

        let guarded: Option<PrimaryKey> = self
            .context
            .store
            .get_as(&mutiny_guard_key(room.id()))
            .await
            .map_err(VoteError::Store)?;

        if guarded == Some(dj.user_id) {
            return Err(VoteError::MutinyCooldown);
        }

        let eligible = snapshot_voters(room, Some(dj.user_id));
        let session = VoteSession::new(
            room,
            VoteKind::Mutiny,
            initiator,
            Some(dj.user_id),
            eligible,
        );

        self.insert_session(room, &session).await?;

        info!("Mutiny {} opened in room {}", session.id, room.data().name);

        self.context.emit(
            room.id(),
            RoomEvent::MutinyStarted {
                room_id: room.id(),
                session: session.clone(),
            },
        );

        self.spawn_timeout(room, session.id);

        Ok(session)
    }

    /// Casts a ballot. Insertion is a compare-and-swap on the session, so a
    /// double-submit over a reconnect lands exactly once, and the
    /// re-evaluation happens in the same critical section as the append.
    pub async fn cast(
        &self,
        room: &Arc<Room>,
        voter: PrimaryKey,
        session_id: Uuid,
        choice: VoteChoice,
    ) -> Result<VoteSession, VoteError> {
        let _guard = room.lock().await;

        room.ensure_active().map_err(VoteError::Room)?;

        for _ in 0..CAS_ATTEMPTS {
            let session = self
                .pending_session(room)
                .await?
                .filter(|s| s.id == session_id)
                .ok_or(VoteError::NoPendingVote)?;

            if !session.is_eligible(voter) {
                return Err(VoteError::NotEligible);
            }

            if session.has_voted(voter) {
                return Err(VoteError::AlreadyVoted);
            }

            validate_choice(&session, choice)?;

            let mut updated = session.clone();
            updated.ballots.insert(voter, choice);

            let verdict = updated.evaluate(false);

            if self.swap_session(room, Some(&session), &mut updated, verdict).await? {
                self.context.emit(
                    room.id(),
                    RoomEvent::VoteResultsUpdated {
                        room_id: room.id(),
                        session: updated.clone(),
                    },
                );

                self.settle_locked(room, &updated, verdict).await?;

                return Ok(updated);
            }
        }

        Err(VoteError::Contention)
    }

    /// The pending session of a room, if any.
    pub async fn pending(&self, room: &Arc<Room>) -> Result<Option<VoteSession>, VoteError> {
        self.pending_session(room).await
    }

    /// Cancels the pending session, if any. Used when the room deactivates or
    /// the vote's target leaves; idempotent.
    pub async fn cancel_locked(&self, room: &Arc<Room>) -> Result<(), VoteError> {
        let Some(session) = self.pending_session(room).await? else {
            return Ok(());
        };

        let mut cancelled = session.clone();

        if !self
            .swap_session(room, Some(&session), &mut cancelled, Verdict::Failed)
            .await?
        {
            // Someone else settled it first; cancellation is idempotent.
            return Ok(());
        }

        info!("Vote {} cancelled in room {}", session.id, room.data().name);

        self.context.emit(
            room.id(),
            RoomEvent::VoteComplete {
                room_id: room.id(),
                session_id: session.id,
                outcome: VoteOutcome::Cancelled,
            },
        );

        Ok(())
    }

    /// Applies a verdict's side effects: DJ transitions, cooldown guards,
    /// and the completion broadcasts. The caller must hold the room lock.
    async fn settle_locked(
        &self,
        room: &Arc<Room>,
        session: &VoteSession,
        verdict: Verdict,
    ) -> Result<(), VoteError> {
        match verdict {
            Verdict::Pending => Ok(()),
            Verdict::Passed { winner } => match session.kind {
                VoteKind::Mutiny => {
                    self.context.emit_all(
                        room.id(),
                        vec![
                            RoomEvent::VoteComplete {
                                room_id: room.id(),
                                session_id: session.id,
                                outcome: VoteOutcome::Passed,
                            },
                            RoomEvent::MutinySucceeded { room_id: room.id() },
                        ],
                    );

                    self.dj
                        .remove_locked(room, DjReason::Mutiny)
                        .await
                        .map_err(VoteError::Dj)
                }
                VoteKind::DjElection => {
                    let winner = winner.ok_or(VoteError::InvalidChoice)?;

                    let outcome = match self.dj.set_by_vote_locked(room, winner).await {
                        Ok(_) => VoteOutcome::Passed,
                        Err(DjError::OnCooldown | DjError::TargetNotInRoom) => VoteOutcome::Failed,
                        Err(e) => return Err(VoteError::Dj(e)),
                    };

                    self.context.emit(
                        room.id(),
                        RoomEvent::VoteComplete {
                            room_id: room.id(),
                            session_id: session.id,
                            outcome,
                        },
                    );

                    Ok(())
                }
            },
            Verdict::Failed => {
                self.context.emit(
                    room.id(),
                    RoomEvent::VoteComplete {
                        room_id: room.id(),
                        session_id: session.id,
                        outcome: VoteOutcome::Failed,
                    },
                );

                if session.kind == VoteKind::Mutiny {
                    self.arm_mutiny_guard(room, session).await?;

                    self.context
                        .emit(room.id(), RoomEvent::MutinyFailed { room_id: room.id() });
                }

                Ok(())
            }
        }
    }

    /// Fails or finalizes the session when its deadline elapses.
    async fn handle_timeout(&self, room: &Arc<Room>, session_id: Uuid) -> Result<(), VoteError> {
        let _guard = room.lock().await;

        let Some(session) = self
            .pending_session(room)
            .await?
            .filter(|s| s.id == session_id)
        else {
            return Ok(());
        };

        let verdict = session.evaluate(true);

        let mut settled = session.clone();

        if !self
            .swap_session(room, Some(&session), &mut settled, verdict)
            .await?
        {
            return Ok(());
        }

        info!("Vote {} timed out in room {}", session.id, room.data().name);

        self.settle_locked(room, &settled, verdict).await
    }

    async fn pending_session(&self, room: &Arc<Room>) -> Result<Option<VoteSession>, VoteError> {
        let session: Option<VoteSession> = self
            .context
            .store
            .get_as(&vote_key(room.id()))
            .await
            .map_err(VoteError::Store)?;

        Ok(session.filter(|s| s.outcome == VoteOutcome::Pending))
    }

    /// Inserts a new pending session, enforcing at most one per room.
    async fn insert_session(&self, room: &Arc<Room>, session: &VoteSession) -> Result<(), VoteError> {
        let encoded = serde_json::to_value(session).expect("session serializes");

        let inserted = self
            .context
            .store
            .compare_and_swap(&vote_key(room.id()), None, Some(encoded), None)
            .await
            .map_err(VoteError::Store)?;

        if !inserted {
            return Err(VoteError::VoteInProgress);
        }

        Ok(())
    }

    /// Swaps the stored session against its expected prior value. A terminal
    /// verdict clears the key, freeing the room for the next vote.
    async fn swap_session(
        &self,
        room: &Arc<Room>,
        expected: Option<&VoteSession>,
        updated: &mut VoteSession,
        verdict: Verdict,
    ) -> Result<bool, VoteError> {
        updated.outcome = match verdict {
            Verdict::Pending => VoteOutcome::Pending,
            Verdict::Passed { .. } => VoteOutcome::Passed,
            Verdict::Failed => VoteOutcome::Failed,
        };

        let next = match verdict {
            Verdict::Pending => {
                Some(serde_json::to_value(&*updated).expect("session serializes"))
            }
            _ => None,
        };

        let expected = expected.map(|s| serde_json::to_value(s).expect("session serializes"));

        self.context
            .store
            .compare_and_swap(&vote_key(room.id()), expected, next, None)
            .await
            .map_err(VoteError::Store)
    }

    async fn arm_mutiny_guard(&self, room: &Arc<Room>, session: &VoteSession) -> Result<(), VoteError> {
        let Some(target) = session.target else {
            return Ok(());
        };

        self.context
            .store
            .put_as(
                &mutiny_guard_key(room.id()),
                &target,
                Some(self.context.config.mutiny_cooldown()),
            )
            .await
            .map_err(VoteError::Store)
    }

    fn spawn_timeout(&self, room: &Arc<Room>, session_id: Uuid) {
        let engine = self.me.clone();
        let room = room.clone();
        let timeout = self.context.config.vote_timeout();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let Some(engine) = engine.upgrade() else {
                return;
            };

            if let Err(e) = engine.handle_timeout(&room, session_id).await {
                warn!("Failed to time out vote {session_id}: {e}");
            }
        });
    }
}

fn validate_choice(session: &VoteSession, choice: VoteChoice) -> Result<(), VoteError> {
    match (session.kind, choice) {
        (VoteKind::Mutiny, VoteChoice::Approve(_)) => Ok(()),
        (VoteKind::DjElection, VoteChoice::Candidate(candidate)) => {
            if session.is_eligible(candidate) {
                Ok(())
            } else {
                Err(VoteError::InvalidChoice)
            }
        }
        _ => Err(VoteError::InvalidChoice),
    }
}

fn snapshot_voters(room: &Arc<Room>, excluding: Option<PrimaryKey>) -> Vec<EligibleVoter> {
    room.members()
        .iter()
        .filter(|m| Some(m.user.id) != excluding)
        .map(|m| EligibleVoter {
            user_id: m.user.id,
            joined_at: m.joined_at,
        })
        .collect()
}

fn vote_key(room_id: PrimaryKey) -> String {
    format!("room:{room_id}:vote")
}

fn mutiny_guard_key(room_id: PrimaryKey) -> String {
    format!("room:{room_id}:mutiny_guard")
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::testutil::TestCollab;
    use crate::UserData;

    async fn with_dj(harness: &TestCollab, extra_members: usize) -> (Arc<Room>, Vec<UserData>) {
        let (room, users) = harness.room_with_members(extra_members).await;

        harness
            .collab
            .dj
            .set_by_owner(&room, users[0].id, users[0].id)
            .await
            .unwrap();

        (room, users)
    }

    #[tokio::test]
    async fn test_mutiny_guards() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(1).await;

        let result = collab.votes.open_mutiny(&room, users[1].id).await;
        assert!(matches!(result, Err(VoteError::NoDjToMutiny)));

        collab
            .dj
            .set_by_owner(&room, users[0].id, users[0].id)
            .await
            .unwrap();

        let result = collab.votes.open_mutiny(&room, users[0].id).await;
        assert!(matches!(result, Err(VoteError::DjCannotMutiny)));

        collab.votes.open_mutiny(&room, users[1].id).await.unwrap();

        let result = collab.votes.open_mutiny(&room, users[1].id).await;
        assert!(
            matches!(result, Err(VoteError::VoteInProgress)),
            "one pending session per room"
        );
    }

    #[tokio::test]
    async fn test_mutiny_passes_and_clears_the_dj() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        // DJ plus 4 listeners; the eligible set is the 4.
        let (room, users) = with_dj(&harness, 4).await;

        let entry = harness.submit(&room, users[1].id).await;
        collab
            .playback
            .start(&room, users[0].id, entry.id)
            .await
            .unwrap();

        let session = collab.votes.open_mutiny(&room, users[1].id).await.unwrap();
        assert_eq!(session.eligible.len(), 4);

        for voter in &users[1..=2] {
            let after = collab
                .votes
                .cast(&room, voter.id, session.id, VoteChoice::Approve(true))
                .await
                .unwrap();

            assert_eq!(after.outcome, VoteOutcome::Pending);
        }

        let after = collab
            .votes
            .cast(&room, users[3].id, session.id, VoteChoice::Approve(true))
            .await
            .unwrap();

        assert_eq!(
            after.outcome,
            VoteOutcome::Passed,
            "3 of 4 clears the 0.51 threshold"
        );

        assert!(collab.dj.current_dj(&room).await.unwrap().is_none());
        assert!(
            !collab.playback.snapshot(&room).await.unwrap().playing,
            "playback stops with the mutinied DJ"
        );

        let history = collab.context.database.dj_history(room.id()).await.unwrap();
        assert_eq!(history[0].reason.as_deref(), Some("mutiny"));
    }

    #[tokio::test]
    async fn test_failed_mutiny_cools_down() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = with_dj(&harness, 2).await;

        let session = collab.votes.open_mutiny(&room, users[1].id).await.unwrap();

        for voter in &users[1..=2] {
            collab
                .votes
                .cast(&room, voter.id, session.id, VoteChoice::Approve(false))
                .await
                .unwrap();
        }

        assert!(
            collab.votes.pending(&room).await.unwrap().is_none(),
            "the failed session is gone"
        );

        let result = collab.votes.open_mutiny(&room, users[1].id).await;
        assert!(
            matches!(result, Err(VoteError::MutinyCooldown)),
            "re-mutiny against the same DJ is refused"
        );
    }

    #[tokio::test]
    async fn test_double_ballot_is_refused() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = with_dj(&harness, 3).await;

        let session = collab.votes.open_mutiny(&room, users[1].id).await.unwrap();

        collab
            .votes
            .cast(&room, users[1].id, session.id, VoteChoice::Approve(true))
            .await
            .unwrap();

        let result = collab
            .votes
            .cast(&room, users[1].id, session.id, VoteChoice::Approve(true))
            .await;

        assert!(matches!(result, Err(VoteError::AlreadyVoted)));
    }

    #[tokio::test]
    async fn test_dj_cannot_vote_in_the_mutiny() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = with_dj(&harness, 2).await;

        let session = collab.votes.open_mutiny(&room, users[1].id).await.unwrap();

        let result = collab
            .votes
            .cast(&room, users[0].id, session.id, VoteChoice::Approve(false))
            .await;

        assert!(
            matches!(result, Err(VoteError::NotEligible)),
            "the target is outside the eligible set"
        );
    }

    #[tokio::test]
    async fn test_election_elects_the_winner() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = harness.room_with_members(2).await;

        let session = collab
            .votes
            .open_election(&room, users[0].id)
            .await
            .unwrap();

        for voter in &users {
            collab
                .votes
                .cast(
                    &room,
                    voter.id,
                    session.id,
                    VoteChoice::Candidate(users[2].id),
                )
                .await
                .unwrap();
        }

        let dj = collab.dj.current_dj(&room).await.unwrap().unwrap();
        assert_eq!(dj.user_id, users[2].id);

        let history = collab.context.database.dj_history(room.id()).await.unwrap();
        assert_eq!(history.len(), 1, "the winner's tenure is on record");

        assert!(collab.votes.pending(&room).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_election_needs_company() {
        let harness = TestCollab::new();
        let (room, users) = harness.room_with_members(0).await;

        let result = harness.collab.votes.open_election(&room, users[0].id).await;
        assert!(matches!(result, Err(VoteError::NeedsMoreMembers)));
    }

    #[tokio::test]
    async fn test_cancellation_is_idempotent() {
        let harness = TestCollab::new();
        let collab = &harness.collab;

        let (room, users) = with_dj(&harness, 2).await;

        collab.votes.open_mutiny(&room, users[1].id).await.unwrap();

        {
            let _guard = room.lock().await;
            collab.votes.cancel_locked(&room).await.unwrap();
            collab.votes.cancel_locked(&room).await.unwrap();
        }

        assert!(collab.votes.pending(&room).await.unwrap().is_none());
    }
}
