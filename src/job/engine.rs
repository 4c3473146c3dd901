use super::handlers::HandlerRegistry;
use super::model::{StepOutcome, StepResult, StepSpecification};
use super::JobError;
use crate::environment::EnvironmentHandle;

/// Engine lifecycle observer. Observers are invoked in registration order at
/// each lifecycle point; an observer error is recorded and never halts the
/// engine or the other observers.
pub trait FlowObserver {
    fn pre_flow(&mut self, _steps: &[StepSpecification]) -> Result<(), String> {
        Ok(())
    }
    fn pre_step(&mut self, _step: &StepSpecification) -> Result<(), String> {
        Ok(())
    }
    fn post_step(&mut self, _step: &StepSpecification, _result: &StepResult) -> Result<(), String> {
        Ok(())
    }
    fn post_flow(&mut self, _results: &[StepResult]) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NotStarted,
    Running(usize),
    Failed,
    Done,
}

/// Strictly sequential step executor. The first failing step halts the
/// sequence; there is no per-step retry and no network awareness. Observers
/// are the only reporting path.
pub struct ExecutionEngine<'a> {
    registry: &'a HandlerRegistry,
    observers: Vec<Box<dyn FlowObserver + 'a>>,
    state: EngineState,
    results: Vec<StepResult>,
    observer_errors: Vec<String>,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(registry: &'a HandlerRegistry) -> Self {
        Self {
            registry,
            observers: Vec::new(),
            state: EngineState::NotStarted,
            results: Vec::new(),
            observer_errors: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn FlowObserver + 'a>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn take_results(&mut self) -> Vec<StepResult> {
        std::mem::take(&mut self.results)
    }

    /// Errors raised by observers, kept out of the execution path.
    pub fn observer_errors(&self) -> &[String] {
        &self.observer_errors
    }

    pub fn run(
        &mut self,
        environment: &EnvironmentHandle,
        steps: &[StepSpecification],
    ) -> Result<(), JobError> {
        self.notify(|observer| observer.pre_flow(steps));

        for (index, step) in steps.iter().enumerate() {
            self.state = EngineState::Running(index);
            self.notify(|observer| observer.pre_step(step));

            let result = match self.registry.execute(environment, step) {
                Ok(()) => StepResult {
                    step_number: step.step_number.clone(),
                    name: step.name.clone(),
                    outcome: StepOutcome::Success,
                    error: None,
                },
                Err(failure) => StepResult {
                    step_number: step.step_number.clone(),
                    name: step.name.clone(),
                    outcome: StepOutcome::Failure,
                    error: Some(failure.reason.clone()),
                },
            };
            self.results.push(result.clone());
            self.notify(|observer| observer.post_step(step, &result));

            if result.outcome == StepOutcome::Failure {
                self.state = EngineState::Failed;
                let results = self.results.clone();
                self.notify(|observer| observer.post_flow(&results));
                return Err(JobError::StepExecution {
                    step_number: step.step_number.to_string(),
                    name: step.name.clone(),
                    reason: result.error.unwrap_or_default(),
                });
            }
        }

        self.state = EngineState::Done;
        let results = self.results.clone();
        self.notify(|observer| observer.post_flow(&results));
        Ok(())
    }

    fn notify<F>(&mut self, mut event: F)
    where
        F: FnMut(&mut Box<dyn FlowObserver + 'a>) -> Result<(), String>,
    {
        for observer in &mut self.observers {
            if let Err(reason) = event(observer) {
                self.observer_errors.push(reason);
            }
        }
    }
}
