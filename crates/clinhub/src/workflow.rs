//! Core workflow traits and types.

use std::time::Duration;

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use time::OffsetDateTime;

use crate::Timer;
use crate::event::ClinicalEvent;
use crate::subsystem::Subsystem;

/// A clinical process modelled as a pure state machine.
///
/// `evolve` rebuilds state from recorded events; `decide` turns the current
/// state and an input into a [`Decision`]. Both must be deterministic and
/// perform no I/O: outbound commands, notifications and timers are returned
/// as intent and executed by the engine through the outbox.
///
/// # Correlation
///
/// Routed clinical events are mapped to inputs by [`Workflow::correlate`].
/// The input names its instance, forming the correlation key:
///
/// ```text
/// correlation_key = (Workflow::TYPE, input.workflow_id())
/// ```
///
/// # Rejections
///
/// An input that makes no sense for the current state is answered with
/// `Err(Rejection)`. The engine records it against the instance and leaves
/// the state untouched.
///
/// # Example
///
/// ```ignore
/// impl Workflow for OrderLifecycle {
///     type State = OrderState;
///     type Input = OrderInput;
///     type Event = OrderEvent;
///
///     const TYPE: &'static str = "order-lifecycle";
///
///     fn correlate(event: &ClinicalEvent) -> Result<OrderInput, CorrelationError> { .. }
///
///     fn decide(now: OffsetDateTime, state: &OrderState, input: &OrderInput)
///         -> Result<Decision<OrderEvent, OrderInput>, Rejection>
///     {
///         match (state.status, input) {
///             (OrderStatus::New, OrderInput::Place { .. }) => Ok(
///                 Decision::event(OrderEvent::Created { .. })
///                     .with_command(Subsystem::Lis, "order.transmit", payload)
///             ),
///             (status, _) => Err(Rejection::new(format!("not accepted in {status:?}"))),
///         }
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// The workflow state, reconstructed by replaying events.
    type State: Default + Send;

    /// Inputs that trigger decisions.
    ///
    /// Must be serializable for timer storage.
    type Input: HasWorkflowId + Serialize + DeserializeOwned + Send + Sync;

    /// Facts recorded to the instance history.
    type Event: Serialize + DeserializeOwned + Clone + Send;

    /// Workflow type identifier. Must be stable across deployments.
    const TYPE: &'static str;

    /// Map a routed clinical event to an input for this workflow.
    fn correlate(event: &ClinicalEvent) -> Result<Self::Input, CorrelationError>;

    /// Reconstruct state from an event.
    fn evolve(state: Self::State, event: Self::Event) -> Self::State;

    /// Decide what to do given the current state and input.
    fn decide(
        now: OffsetDateTime,
        state: &Self::State,
        input: &Self::Input,
    ) -> Result<Decision<Self::Event, Self::Input>, Rejection>;

    /// Terminal states are absorbing: no further input is applied.
    fn is_terminal(_state: &Self::State) -> bool {
        false
    }

    /// Short status name reported in queries and audit records.
    fn status(state: &Self::State) -> &'static str;

    /// Input delivered when the instance stays non-terminal past its deadline.
    ///
    /// Returning `None` disables deadline monitoring for this workflow type.
    fn timeout_input(_workflow_id: &WorkflowId) -> Option<Self::Input> {
        None
    }

    /// Input representing an operator cancellation request.
    ///
    /// Returning `None` means the workflow type cannot be cancelled.
    fn cancel_input(_workflow_id: &WorkflowId, _reason: &str) -> Option<Self::Input> {
        None
    }
}

/// Extracts the workflow instance ID (business key) from an input.
pub trait HasWorkflowId {
    /// Returns the workflow instance ID for this input.
    ///
    /// Should return the same ID for all inputs targeting the same workflow instance.
    fn workflow_id(&self) -> WorkflowId;
}

/// A clinical event could not be mapped to a workflow input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct CorrelationError {
    pub reason: String,
}

impl CorrelationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The payload carries none of the expected business keys.
    pub fn missing_key(keys: &[&str]) -> Self {
        Self::new(format!("payload has none of: {}", keys.join(", ")))
    }

    pub fn unsupported(event_type: &str) -> Self {
        Self::new(format!("event type {event_type} is not handled"))
    }
}

/// An input that is not a valid transition from the current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A workflow instance identifier (business key).
///
/// Use natural business keys (order id, prescription id) rather than synthetic UUIDs.
///
/// # Example
///
/// ```
/// use clinhub::WorkflowId;
///
/// let id = WorkflowId::new("ord-123");
/// assert_eq!(id.as_str(), "ord-123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Create a new workflow ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Consume the wrapper and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Reference to a specific workflow instance.
///
/// # Example
///
/// ```
/// use clinhub::WorkflowRef;
///
/// let workflow = WorkflowRef::new("order-lifecycle", "ord-123");
/// assert_eq!(format!("{}", workflow), "order-lifecycle:ord-123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowRef {
    workflow_type: String,
    workflow_id: WorkflowId,
}

impl WorkflowRef {
    /// Create a new workflow reference.
    pub fn new(workflow_type: impl Into<String>, workflow_id: impl Into<WorkflowId>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            workflow_id: workflow_id.into(),
        }
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }
}

impl std::fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.workflow_type, self.workflow_id)
    }
}

/// An outbound command requested by a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub target: Subsystem,
    /// Verb understood by the receiving subsystem, e.g. `order.transmit`.
    pub action: String,
    pub payload: Value,
}

/// Actions to execute as a result of a workflow decision.
///
/// Every accepted decision produces at least one event (enforced by
/// [`NonEmpty`]), so every applied input leaves a trace in the history.
///
/// - **Events**: facts about what happened (at least one required)
/// - **Commands**: outbound commands written to the outbox
/// - **Timers**: inputs to deliver at a future time
/// - **Timer cancellations**: remove pending timers by key
///
/// Notifications are commands targeting [`Subsystem::Notification`].
#[derive(Debug, Clone)]
pub struct Decision<E, I> {
    events: NonEmpty<E>,
    commands: Vec<CommandSpec>,
    timers: Vec<Timer<I>>,
    cancel_timers: Vec<String>,
}

impl<E, I> Decision<E, I> {
    /// Create a decision with a single event.
    pub fn event(event: E) -> Self {
        Self::from_events(NonEmpty::new(event))
    }

    /// Create a decision from a non-empty collection of events.
    pub fn from_events(events: NonEmpty<E>) -> Self {
        Self {
            events,
            commands: vec![],
            timers: vec![],
            cancel_timers: vec![],
        }
    }

    /// Try to create a decision from an iterator of events.
    ///
    /// Returns `None` if the iterator is empty.
    pub fn try_from_iter(events: impl IntoIterator<Item = E>) -> Option<Self> {
        NonEmpty::collect(events).map(Self::from_events)
    }

    /// Send a command to a subsystem.
    pub fn with_command(mut self, target: Subsystem, action: impl Into<String>, payload: Value) -> Self {
        self.commands.push(CommandSpec {
            target,
            action: action.into(),
            payload,
        });
        self
    }

    /// Dispatch a notification request to the notification collaborator.
    pub fn with_notification(self, kind: impl Into<String>, payload: Value) -> Self {
        self.with_command(Subsystem::Notification, kind, payload)
    }

    /// Add a timer to this decision.
    pub fn with_timer(mut self, timer: Timer<I>) -> Self {
        self.timers.push(timer);
        self
    }

    /// Add a timer that fires after a delay from now.
    pub fn with_timer_after(self, delay: Duration, input: I) -> Self {
        self.with_timer(Timer::after(delay, input))
    }

    /// Cancel a pending timer by key.
    pub fn cancel_timer(mut self, key: impl Into<String>) -> Self {
        self.cancel_timers.push(key.into());
        self
    }

    pub fn events(&self) -> &NonEmpty<E> {
        &self.events
    }

    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }

    pub fn timers(&self) -> &[Timer<I>] {
        &self.timers
    }

    pub fn canceled_timers(&self) -> &[String] {
        &self.cancel_timers
    }

    /// Consume the decision into its parts.
    pub(crate) fn into_parts(self) -> (NonEmpty<E>, Vec<CommandSpec>, Vec<Timer<I>>, Vec<String>) {
        (self.events, self.commands, self.timers, self.cancel_timers)
    }
}
