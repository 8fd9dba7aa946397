use hibernate::{
    Continuation, FlowConfig, Finished, Id, Reflective, Resumption, Service, Step, StepContext,
    SuspendPoint, Task, TaskError, TaskResult, inspect, when_all, when_any,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::{Ready, ready};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

// ============================================================================
// Suspension inbox - records the step ids handed to suspension callbacks
// ============================================================================

static INBOX: LazyLock<Mutex<HashMap<Id, Vec<Id>>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Suspension callback that records the step id under its flow.
pub fn record_step(point: SuspendPoint) -> Ready<anyhow::Result<()>> {
    INBOX
        .lock()
        .unwrap()
        .entry(point.flow_id)
        .or_default()
        .push(point.step_id);
    ready(Ok(()))
}

/// Step ids recorded for `flow_id` since the last call, in callback order.
pub fn take_steps(flow_id: Id) -> Vec<Id> {
    INBOX
        .lock()
        .unwrap()
        .remove(&flow_id)
        .unwrap_or_default()
}

/// Configuration registering every continuation in this module.
pub fn config() -> FlowConfig {
    FlowConfig::builder()
        .continuation::<Greeting>()
        .continuation::<Envelope>()
        .continuation::<Sum>()
        .continuation::<Race>()
        .continuation::<Hedge>()
        .continuation::<Faulty>()
        .continuation::<Panicky>()
        .continuation::<Sleeper>()
        .continuation::<Notifier>()
        .continuation_as::<Reflective<Ticker>>("ticker")
        .service::<dyn Mailer>()
        .build()
        .expect("Failed to build flow configuration")
}

// ============================================================================
// Greeting - waits for one reply
// ============================================================================

pub struct Greeting {
    pub state: u32,
    pub name: String,
}

impl Greeting {
    pub fn new(name: &str) -> Self {
        Self {
            state: 0,
            name: name.to_string(),
        }
    }
}

inspect! { Greeting { awaiter state, user name } }

impl Continuation for Greeting {
    type Output = String;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<String>> {
        match self.state {
            0 => {
                self.state = 1;
                Ok(Step::wait(Task::<String>::suspend(record_step)))
            }
            _ => {
                let reply: String = input.value()?;
                Ok(Step::Done(format!("{}: {}", self.name, reply)))
            }
        }
    }
}

// ============================================================================
// Envelope - awaits a nested Greeting
// ============================================================================

pub struct Envelope {
    pub state: u32,
    pub label: String,
}

inspect! { Envelope { awaiter state, user label } }

impl Continuation for Envelope {
    type Output = String;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<String>> {
        match self.state {
            0 => {
                self.state = 1;
                Ok(Step::wait(Task::from_continuation(Greeting::new("inner"))))
            }
            _ => {
                let greeting: String = input.value()?;
                Ok(Step::Done(format!("{}({})", self.label, greeting)))
            }
        }
    }
}

// ============================================================================
// Sum - when_all over several suspended numbers
// ============================================================================

pub struct Sum {
    pub state: u32,
    pub count: u32,
}

inspect! { Sum { awaiter state, user count } }

impl Continuation for Sum {
    type Output = u32;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<u32>> {
        match self.state {
            0 => {
                self.state = 1;
                let parts = (0..self.count).map(|_| Task::<u32>::suspend(record_step));
                Ok(Step::wait(when_all(parts)))
            }
            _ => {
                let values: Vec<u32> = input.value()?;
                Ok(Step::Done(values.iter().sum()))
            }
        }
    }
}

// ============================================================================
// Race - when_any over two suspended strings
// ============================================================================

pub struct Race {
    pub state: u32,
}

inspect! { Race { awaiter state } }

impl Continuation for Race {
    type Output = String;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<String>> {
        match self.state {
            0 => {
                self.state = 1;
                Ok(Step::wait(when_any([
                    Task::<String>::suspend(record_step),
                    Task::<String>::suspend(record_step),
                ])))
            }
            _ => {
                let first: Finished<String> = input.value()?;
                let value = first.outcome.succeeded().unwrap_or_default();
                Ok(Step::Done(format!("{}:{}", first.index, value)))
            }
        }
    }
}

// ============================================================================
// Hedge - when_any with a ready branch, then one more suspension
// ============================================================================

#[derive(Default)]
pub struct Hedge {
    pub state: u32,
    pub winner: String,
}

inspect! { Hedge { awaiter state, user winner } }

impl Continuation for Hedge {
    type Output = String;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<String>> {
        match self.state {
            0 => {
                self.state = 1;
                Ok(Step::wait(when_any([
                    Task::completed("cached".to_string()),
                    Task::<String>::suspend(record_step),
                ])))
            }
            1 => {
                let first: Finished<String> = input.value()?;
                self.winner = first.outcome.succeeded().unwrap_or_default();
                self.state = 2;
                Ok(Step::wait(Task::<String>::suspend(record_step)))
            }
            _ => {
                let reply: String = input.value()?;
                Ok(Step::Done(format!("{}+{}", self.winner, reply)))
            }
        }
    }
}

// ============================================================================
// Faulty / Panicky - computations that fail
// ============================================================================

pub struct Faulty {
    pub state: u32,
}

inspect! { Faulty { awaiter state } }

impl Continuation for Faulty {
    type Output = String;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<String>> {
        match self.state {
            0 => {
                self.state = 1;
                Ok(Step::wait(Task::<String>::suspend(record_step)))
            }
            _ => {
                let reply: String = input.value()?;
                Err(TaskError::Failed(anyhow::anyhow!("refused: {reply}")))
            }
        }
    }
}

pub struct Panicky {
    pub state: u32,
}

inspect! { Panicky { awaiter state } }

impl Continuation for Panicky {
    type Output = String;

    fn resume(&mut self, _cx: &mut StepContext<'_>, _input: Resumption) -> TaskResult<Step<String>> {
        panic!("panicky continuation exploded");
    }
}

// ============================================================================
// Sleeper - waits on a timer delivered by the reminder worker
// ============================================================================

pub struct Sleeper {
    pub state: u32,
    pub millis: u64,
}

inspect! { Sleeper { awaiter state, user millis } }

impl Continuation for Sleeper {
    type Output = String;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<String>> {
        match self.state {
            0 => {
                self.state = 1;
                Ok(Step::wait(Task::delay(Duration::from_millis(self.millis))))
            }
            _ => {
                input.value::<()>()?;
                Ok(Step::Done("awake".to_string()))
            }
        }
    }
}

// ============================================================================
// Ticker - reflective continuation that yields a few times
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct Ticker {
    pub state: u32,
    pub remaining: u32,
    pub ticks: u32,
}

impl Ticker {
    pub fn new(remaining: u32) -> Reflective<Self> {
        Reflective(Self {
            state: 0,
            remaining,
            ticks: 0,
        })
    }
}

impl Continuation for Ticker {
    type Output = u32;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<u32>> {
        if !input.is_start() {
            input.value::<()>()?;
            self.ticks += 1;
        }
        if self.remaining == 0 {
            return Ok(Step::Done(self.ticks));
        }
        self.remaining -= 1;
        self.state += 1;
        Ok(Step::wait(Task::yield_now()))
    }
}

// ============================================================================
// Notifier - holds an injected service across a suspension
// ============================================================================

pub trait Mailer: Send + Sync {
    /// Send a message; returns how many messages this mailer sent so far.
    fn send(&self, to: &str, body: &str) -> usize;
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl Mailer for RecordingMailer {
    fn send(&self, to: &str, body: &str) -> usize {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), body.to_string()));
        sent.len()
    }
}

pub struct Notifier {
    pub state: u32,
    pub to: String,
    pub mailer: Service<dyn Mailer>,
}

inspect! { Notifier { awaiter state, user to, surrogate mailer } }

impl Notifier {
    pub fn new(to: &str, mailer: Service<dyn Mailer>) -> Self {
        Self {
            state: 0,
            to: to.to_string(),
            mailer,
        }
    }
}

impl Continuation for Notifier {
    type Output = usize;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<usize>> {
        match self.state {
            0 => {
                self.state = 1;
                Ok(Step::wait(Task::<String>::suspend(record_step)))
            }
            _ => {
                let body: String = input.value()?;
                Ok(Step::Done(self.mailer.send(&self.to, &body)))
            }
        }
    }
}
