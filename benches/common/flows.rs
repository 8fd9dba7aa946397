use hibernate::{
    Continuation, FlowConfig, Resumption, Step, StepContext, SuspendPoint, Task, TaskResult,
    inspect, when_all,
};
use std::future::{Ready, ready};

/// Suspension callback for benchmarks; triggers are taken from `pending()`.
pub fn ignore(_point: SuspendPoint) -> Ready<anyhow::Result<()>> {
    ready(Ok(()))
}

pub fn bench_config() -> FlowConfig {
    FlowConfig::builder()
        .continuation::<ChainBench>()
        .continuation::<PayloadBench>()
        .continuation::<FanBench>()
        .continuation::<YieldBench>()
        .build()
        .expect("Failed to build bench configuration")
}

// ============================================================================
// ChainBench - suspends `remaining` times in a row, summing the inputs
// ============================================================================

pub struct ChainBench {
    pub state: u32,
    pub remaining: u32,
    pub total: u64,
}

inspect! { ChainBench { awaiter state, user remaining, user total } }

impl ChainBench {
    pub fn new(steps: u32) -> Self {
        Self {
            state: 0,
            remaining: steps,
            total: 0,
        }
    }
}

impl Continuation for ChainBench {
    type Output = u64;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<u64>> {
        if !input.is_start() {
            self.total += input.value::<u64>()?;
        }
        if self.remaining == 0 {
            return Ok(Step::Done(self.total));
        }
        self.remaining -= 1;
        self.state = 1;
        Ok(Step::wait(Task::<u64>::suspend(ignore)))
    }
}

// ============================================================================
// PayloadBench - carries a large user field across one suspension
// ============================================================================

pub struct PayloadBench {
    pub state: u32,
    pub data: String,
}

inspect! { PayloadBench { awaiter state, user data } }

impl PayloadBench {
    pub fn new(size: usize) -> Self {
        Self {
            state: 0,
            data: "x".repeat(size),
        }
    }
}

impl Continuation for PayloadBench {
    type Output = usize;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<usize>> {
        match self.state {
            0 => {
                self.state = 1;
                Ok(Step::wait(Task::<u64>::suspend(ignore)))
            }
            _ => {
                input.value::<u64>()?;
                Ok(Step::Done(self.data.len()))
            }
        }
    }
}

// ============================================================================
// FanBench - when_all over `width` suspensions
// ============================================================================

pub struct FanBench {
    pub state: u32,
    pub width: u32,
}

inspect! { FanBench { awaiter state, user width } }

impl Continuation for FanBench {
    type Output = u64;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<u64>> {
        match self.state {
            0 => {
                self.state = 1;
                Ok(Step::wait(when_all(
                    (0..self.width).map(|_| Task::<u64>::suspend(ignore)),
                )))
            }
            _ => {
                let values: Vec<u64> = input.value()?;
                Ok(Step::Done(values.iter().sum()))
            }
        }
    }
}

// ============================================================================
// YieldBench - yields `remaining` times, delivered by the reminder worker
// ============================================================================

pub struct YieldBench {
    pub state: u32,
    pub remaining: u32,
}

inspect! { YieldBench { awaiter state, user remaining } }

impl Continuation for YieldBench {
    type Output = u32;

    fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<u32>> {
        if !input.is_start() {
            input.value::<()>()?;
        }
        if self.remaining == 0 {
            return Ok(Step::Done(self.state));
        }
        self.remaining -= 1;
        self.state += 1;
        Ok(Step::wait(Task::yield_now()))
    }
}
