use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// How often a blocked receive checks whether the fabric was aborted.
const ABORT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("The run was aborted by another rank")]
    Aborted,
    #[error("Rank {0} is no longer reachable")]
    Disconnected(usize),
    #[error("Rank {0} does not exist")]
    InvalidRank(usize),
    #[error("A group needs at least one member")]
    EmptyGroup,
    #[error("Rank {0} is not a member of the group")]
    NotAMember(usize),
    #[error("Unexpected payload type received from rank {0}")]
    PayloadType(usize),
    #[error("{0}")]
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Collective { group: u32, seq: u64 },
    User(u32),
}

struct Envelope {
    from: usize,
    tag: Tag,
    payload: Box<dyn Any + Send>,
}

/// A subset of ranks that performs collectives together. The first member is the root.
///
/// Every member must create the group with the same id and members, and call its
/// collectives in the same order.
#[derive(Debug)]
pub struct Group {
    id: u32,
    members: Vec<usize>,
    seq: Cell<u64>,
}

impl Group {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn root(&self) -> usize {
        self.members[0]
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.members.contains(&rank)
    }

    fn next_tag(&self) -> Tag {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        Tag::Collective {
            group: self.id,
            seq,
        }
    }
}

/// The communication endpoint of one rank.
///
/// Built in sets by [`build_fabric`]. Messages between a pair of ranks with the same
/// tag arrive in send order; messages with other tags are held back until asked for.
pub struct RankComm {
    rank: usize,
    senders: Vec<Sender<Envelope>>,
    receiver: Receiver<Envelope>,
    pending: RefCell<Vec<Envelope>>,
    aborted: Arc<AtomicBool>,
}

impl std::fmt::Debug for RankComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankComm")
            .field("rank", &self.rank)
            .field("size", &self.size())
            .finish()
    }
}

/// Connects `size` ranks; entry `i` of the result belongs to rank `i`.
pub fn build_fabric(size: usize) -> Vec<RankComm> {
    let aborted = Arc::new(AtomicBool::new(false));
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, receiver)| RankComm {
            rank,
            senders: senders.clone(),
            receiver,
            pending: RefCell::new(Vec::new()),
            aborted: Arc::clone(&aborted),
        })
        .collect()
}

impl RankComm {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.senders.len()
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// All ranks, rooted at rank 0.
    pub fn world(&self) -> Group {
        Group {
            id: 0,
            members: (0..self.size()).collect(),
            seq: Cell::new(0),
        }
    }

    /// A sub-group; no communication is involved.
    pub fn group(&self, id: u32, members: Vec<usize>) -> Result<Group, CommError> {
        if members.is_empty() {
            return Err(CommError::EmptyGroup);
        }
        if let Some(&bad) = members.iter().find(|&&m| m >= self.size()) {
            return Err(CommError::InvalidRank(bad));
        }
        if !members.contains(&self.rank) {
            return Err(CommError::NotAMember(self.rank));
        }
        Ok(Group {
            id,
            members,
            seq: Cell::new(0),
        })
    }

    /// Makes every blocked or future receive on every rank fail with [`CommError::Aborted`].
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn post(&self, to: usize, tag: Tag, payload: Box<dyn Any + Send>) -> Result<(), CommError> {
        let sender = self.senders.get(to).ok_or(CommError::InvalidRank(to))?;
        sender
            .send(Envelope {
                from: self.rank,
                tag,
                payload,
            })
            .map_err(|_| CommError::Disconnected(to))
    }

    fn take(&self, from: usize, tag: Tag) -> Result<Box<dyn Any + Send>, CommError> {
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(pos) = pending.iter().position(|e| e.from == from && e.tag == tag) {
                return Ok(pending.remove(pos).payload);
            }
        }
        // Messages already delivered are still handed out after an abort.
        loop {
            match self.receiver.recv_timeout(ABORT_POLL) {
                Ok(envelope) if envelope.from == from && envelope.tag == tag => {
                    return Ok(envelope.payload);
                }
                Ok(envelope) => self.pending.borrow_mut().push(envelope),
                Err(RecvTimeoutError::Timeout) if self.is_aborted() => {
                    return Err(CommError::Aborted);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(CommError::Disconnected(from)),
            }
        }
    }

    fn take_as<T: 'static>(&self, from: usize, tag: Tag) -> Result<T, CommError> {
        self.take(from, tag)?
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| CommError::PayloadType(from))
    }

    pub fn send<T: Send + 'static>(&self, to: usize, tag: u32, value: T) -> Result<(), CommError> {
        self.post(to, Tag::User(tag), Box::new(value))
    }

    pub fn recv<T: 'static>(&self, from: usize, tag: u32) -> Result<T, CommError> {
        if from >= self.size() {
            return Err(CommError::InvalidRank(from));
        }
        self.take_as(from, Tag::User(tag))
    }

    /// The root passes `Some(value)`; every member returns a copy of it.
    pub fn broadcast<T: Clone + Send + 'static>(
        &self,
        group: &Group,
        value: Option<T>,
    ) -> Result<T, CommError> {
        let tag = group.next_tag();
        let root = group.root();
        if self.rank == root {
            let value = value.ok_or_else(|| {
                CommError::Remote("broadcast root has no value to send".to_string())
            })?;
            for &member in group.members.iter().filter(|&&m| m != root) {
                self.post(member, tag, Box::new(value.clone()))?;
            }
            Ok(value)
        } else {
            self.take_as(root, tag)
        }
    }

    /// The root receives every member's value in member order; the others get `None`.
    pub fn gather<T: Send + 'static>(
        &self,
        group: &Group,
        value: T,
    ) -> Result<Option<Vec<T>>, CommError> {
        let tag = group.next_tag();
        let root = group.root();
        if self.rank != root {
            self.post(root, tag, Box::new(value))?;
            return Ok(None);
        }
        let mut own = Some(value);
        let mut values = Vec::with_capacity(group.size());
        for &member in &group.members {
            if member == root {
                if let Some(v) = own.take() {
                    values.push(v);
                }
            } else {
                values.push(self.take_as(member, tag)?);
            }
        }
        Ok(Some(values))
    }

    /// Every member receives every member's value in member order.
    pub fn all_gather<T: Clone + Send + 'static>(
        &self,
        group: &Group,
        value: T,
    ) -> Result<Vec<T>, CommError> {
        let gathered = self.gather(group, value)?;
        self.broadcast(group, gathered)
    }

    /// Element-wise sum over all members. The sum is formed in member order on the root,
    /// so every member ends up with bit-identical values.
    pub fn all_reduce_sum(&self, group: &Group, values: &mut [f64]) -> Result<(), CommError> {
        let gathered = self.gather(group, values.to_vec())?;
        let summed = gathered.map(|all| {
            let mut total = vec![0.0; values.len()];
            for contribution in &all {
                for (t, v) in total.iter_mut().zip(contribution) {
                    *t += v;
                }
            }
            total
        });
        let total = self.broadcast(group, summed)?;
        values.copy_from_slice(&total);
        Ok(())
    }

    pub fn barrier(&self, group: &Group) -> Result<(), CommError> {
        self.all_gather(group, ()).map(|_| ())
    }
}
