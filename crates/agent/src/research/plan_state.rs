//! Mutable state of one research run, and the pure continuation decision.

use serde::{Deserialize, Serialize};

/// Phases of the research loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchPhase {
    Planning,
    Executing,
    Replanning,
    Synthesizing,
    Done,
}

/// An ordered list of research steps, as returned by the planner and the
/// replanner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub steps: Vec<String>,
}

impl Plan {
    /// JSON schema the oracle's structured output must follow.
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "steps": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Steps to follow, in order"
                }
            },
            "required": ["steps"],
            "additionalProperties": false
        })
    }
}

/// State owned by exactly one research run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanState {
    pub objective: String,
    /// Steps not yet executed, in order.
    pub remaining: Vec<String>,
    /// Executed `(step, result)` pairs, in execution order.
    pub history: Vec<(String, String)>,
    /// Only increases; one per executed step.
    pub steps_executed: u32,
}

impl PlanState {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            remaining: Vec::new(),
            history: Vec::new(),
            steps_executed: 0,
        }
    }

    pub fn replace_plan(&mut self, steps: Vec<String>) {
        self.remaining = steps;
    }

    /// Remove and return the next step.
    pub fn pop_next(&mut self) -> Option<String> {
        if self.remaining.is_empty() {
            None
        } else {
            Some(self.remaining.remove(0))
        }
    }

    pub fn record(&mut self, step: impl Into<String>, result: impl Into<String>) {
        self.history.push((step.into(), result.into()));
        self.steps_executed += 1;
    }

    /// The remaining plan as a numbered list.
    pub fn format_plan(&self) -> String {
        format_steps(&self.remaining)
    }

    /// Executed steps as `Step:`/`Result:` pairs for replanning.
    pub fn format_history(&self) -> String {
        if self.history.is_empty() {
            return "No steps executed yet.".into();
        }
        self.history
            .iter()
            .map(|(step, result)| format!("Step: {step}\nResult: {result}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Executed steps as research notes for synthesis.
    pub fn format_notes(&self) -> String {
        if self.history.is_empty() {
            return "No research results available.".into();
        }
        self.history
            .iter()
            .map(|(step, result)| format!("Step: {step}\nResult: {result}"))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub fn format_steps(steps: &[String]) -> String {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {step}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Where the loop goes after planning or replanning.
///
/// The budget is checked first, so an exhausted budget forces synthesis
/// even when steps remain.
pub fn decide(state: &PlanState, budget: u32) -> ResearchPhase {
    if state.steps_executed >= budget {
        ResearchPhase::Synthesizing
    } else if state.remaining.is_empty() {
        ResearchPhase::Synthesizing
    } else {
        ResearchPhase::Executing
    }
}
