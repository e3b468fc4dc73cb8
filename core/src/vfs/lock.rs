//! The five-state file lock of the SQL engine, expressed as a pure state machine plus a manager
//! that performs each step against a [`LockProvider`].
//!
//! Under the shared policy two named mutexes per file implement the states:
//!
//! | state     | outer     | inner     |
//! |-----------|-----------|-----------|
//! | NONE      | -         | -         |
//! | SHARED    | -         | shared    |
//! | RESERVED  | exclusive | -         |
//! | EXCLUSIVE | exclusive | exclusive |
//!
//! New readers pass through the outer mutex, so a RESERVED holder stops new readers from arriving
//! while existing readers drain out of the inner one.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::platform::{HeldLock, LockMode, LockProvider, PlatformLockError};
use crate::config::LockPolicy;
use crate::error::VfsError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockState {
    #[default]
    None = 0,
    Shared = 1,
    Reserved = 2,
    Pending = 3,
    Exclusive = 4,
}

impl LockState {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(LockState::None),
            1 => Some(LockState::Shared),
            2 => Some(LockState::Reserved),
            3 => Some(LockState::Pending),
            4 => Some(LockState::Exclusive),
            _ => None,
        }
    }

    // PENDING is only ever a waypoint on the way to EXCLUSIVE
    fn normalized(self) -> Self {
        match self {
            LockState::Pending => LockState::Exclusive,
            other => other,
        }
    }
}

/// A single step between adjacent lock states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    NoneToShared,
    SharedToReserved,
    ReservedToExclusive,
    ExclusiveToReserved,
    ReservedToShared,
    SharedToNone,
}

impl Transition {
    pub fn from(self) -> LockState {
        match self {
            Transition::NoneToShared => LockState::None,
            Transition::SharedToReserved | Transition::SharedToNone => LockState::Shared,
            Transition::ReservedToExclusive | Transition::ReservedToShared => LockState::Reserved,
            Transition::ExclusiveToReserved => LockState::Exclusive,
        }
    }

    pub fn to(self) -> LockState {
        match self {
            Transition::SharedToNone => LockState::None,
            Transition::NoneToShared | Transition::ReservedToShared => LockState::Shared,
            Transition::SharedToReserved | Transition::ExclusiveToReserved => LockState::Reserved,
            Transition::ReservedToExclusive => LockState::Exclusive,
        }
    }

    fn up(from: LockState) -> Option<Self> {
        match from {
            LockState::None => Some(Transition::NoneToShared),
            LockState::Shared => Some(Transition::SharedToReserved),
            LockState::Reserved => Some(Transition::ReservedToExclusive),
            LockState::Pending | LockState::Exclusive => None,
        }
    }

    fn down(from: LockState) -> Option<Self> {
        match from {
            LockState::Exclusive | LockState::Pending => Some(Transition::ExclusiveToReserved),
            LockState::Reserved => Some(Transition::ReservedToShared),
            LockState::Shared => Some(Transition::SharedToNone),
            LockState::None => None,
        }
    }
}

/// Lock state of one file handle. Holds no resources; it only says which steps a request implies and
/// refuses steps that don't start from the current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockMachine {
    state: LockState,
}

impl LockMachine {
    pub fn state(&self) -> LockState { self.state }

    /// Steps from the current state up to `target`. Empty when already there or above.
    pub fn plan_lock(&self, target: LockState) -> Vec<Transition> {
        let target = target.normalized();
        let mut steps = Vec::new();
        let mut state = self.state;
        while state < target {
            let Some(step) = Transition::up(state) else { break };
            steps.push(step);
            state = step.to();
        }
        steps
    }

    /// Steps from the current state down to `target`. Empty when already there or below.
    pub fn plan_unlock(&self, target: LockState) -> Vec<Transition> {
        let target = target.normalized();
        let mut steps = Vec::new();
        let mut state = self.state;
        while state > target {
            let Some(step) = Transition::down(state) else { break };
            steps.push(step);
            state = step.to();
        }
        steps
    }

    pub fn apply(&mut self, step: Transition) -> Result<(), VfsError> {
        if step.from() != self.state {
            return Err(VfsError::Lock(format!("unexpected transition {:?} from {:?}", step, self.state)));
        }
        self.state = step.to();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub policy: LockPolicy,
    pub timeout: Option<Duration>,
    pub max_retry: Duration,
}

/// Performs lock transitions for one open file.
pub struct LockManager {
    outer: String,
    inner: String,
    settings: LockSettings,
    provider: Arc<dyn LockProvider>,
    held: tokio::sync::Mutex<Held>,
}

#[derive(Default)]
struct Held {
    machine: LockMachine,
    outer: Option<HeldLock>,
    inner: Option<HeldLock>,
}

impl LockManager {
    pub fn new(path: &str, provider: Arc<dyn LockProvider>, settings: LockSettings) -> Self {
        Self { outer: format!("{path}-outer"), inner: format!("{path}-inner"), settings, provider, held: Default::default() }
    }

    pub async fn state(&self) -> LockState { self.held.lock().await.machine.state() }

    /// Escalate to `target`, one step at a time. If a step fails the lock stays at the last state reached.
    pub async fn lock(&self, target: LockState) -> Result<LockState, VfsError> {
        let mut held = self.held.lock().await;
        for step in held.machine.plan_lock(target) {
            self.step(&mut held, step).await?;
        }
        Ok(held.machine.state())
    }

    /// Release down to `target`.
    pub async fn unlock(&self, target: LockState) -> Result<LockState, VfsError> {
        let mut held = self.held.lock().await;
        for step in held.machine.plan_unlock(target) {
            self.step(&mut held, step).await?;
        }
        Ok(held.machine.state())
    }

    /// Whether any context holds RESERVED or above on this file.
    pub fn check_reserved(&self) -> bool { self.provider.held_exclusively(&self.outer) }

    async fn step(&self, held: &mut Held, step: Transition) -> Result<(), VfsError> {
        match self.settings.policy {
            LockPolicy::Shared => self.shared_step(held, step).await?,
            LockPolicy::Exclusive => self.exclusive_step(held, step).await?,
        }
        held.machine.apply(step)?;
        debug!("{}: {:?} -> {:?}", self.outer.trim_end_matches("-outer"), step.from(), step.to());
        Ok(())
    }

    async fn shared_step(&self, held: &mut Held, step: Transition) -> Result<(), VfsError> {
        match step {
            Transition::NoneToShared => {
                let outer = self.acquire(&self.outer, LockMode::Shared).await?;
                held.inner = Some(self.acquire(&self.inner, LockMode::Shared).await?);
                drop(outer);
            }
            Transition::SharedToReserved => {
                held.outer = Some(self.reserve().await?);
                held.inner = None;
            }
            Transition::ReservedToExclusive => {
                held.inner = Some(self.acquire(&self.inner, LockMode::Exclusive).await?);
            }
            Transition::ExclusiveToReserved => {
                held.inner = None;
            }
            Transition::ReservedToShared => {
                held.inner = Some(self.acquire(&self.inner, LockMode::Shared).await?);
                held.outer = None;
            }
            Transition::SharedToNone => {
                held.inner = None;
            }
        }
        Ok(())
    }

    async fn exclusive_step(&self, held: &mut Held, step: Transition) -> Result<(), VfsError> {
        match step {
            Transition::NoneToShared => held.outer = Some(self.acquire(&self.outer, LockMode::Exclusive).await?),
            Transition::SharedToNone => held.outer = None,
            _ => {}
        }
        Ok(())
    }

    /// Poll for the outer mutex with backoff. Gives up as soon as another context is seen holding RESERVED,
    /// since that context is about to wait for our SHARED to go away.
    async fn reserve(&self) -> Result<HeldLock, VfsError> {
        let started = tokio::time::Instant::now();
        let mut delay = Duration::from_millis(1);
        loop {
            if let Some(held) = self.provider.try_acquire(&self.outer, LockMode::Exclusive) {
                return Ok(held);
            }
            if self.provider.held_exclusively(&self.outer) {
                return Err(VfsError::Busy);
            }
            if self.settings.timeout.is_some_and(|t| started.elapsed() >= t) {
                return Err(VfsError::Busy);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.settings.max_retry);
        }
    }

    async fn acquire(&self, name: &str, mode: LockMode) -> Result<HeldLock, VfsError> {
        self.provider.acquire(name, mode, self.settings.timeout).await.map_err(|err| match err {
            PlatformLockError::TimedOut(_) => VfsError::Busy,
            other => VfsError::Lock(other.to_string()),
        })
    }
}
