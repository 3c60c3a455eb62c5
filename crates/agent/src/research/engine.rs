//! The iterative research loop: plan, execute, replan, synthesize.
//!
//! Only synthesis produces user-visible output. Oracle failures in the
//! earlier phases are absorbed: a failed plan or replan ends the research
//! and a failed step records its error as the step result.

use std::sync::Arc;
use std::time::{Duration, Instant};
use threadloom_config::ResearchConfig;
use threadloom_core::oracle::{
    ModelSettings, Oracle, ResponseFormat, invoke_streaming, invoke_structured, invoke_tool_capable,
};
use threadloom_core::{Message, ResponseChunk, ToolRegistry};
use tracing::{debug, info, warn};

use super::plan_state::{Plan, PlanState, ResearchPhase, decide, format_steps};
use crate::strategy::ChunkSender;

pub const DEFAULT_STEP_BUDGET: u32 = 15;

const NO_RESPONSE: &str = "research finished without producing a response";

/// Everything a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub state: PlanState,
    /// The synthesized text as streamed.
    pub content: String,
    /// Every phase entered, in order.
    pub phases: Vec<ResearchPhase>,
    /// Objective, plan, step results and answer, for the session's run log.
    pub run_log: Vec<Message>,
}

impl ResearchOutcome {
    pub fn executed_steps(&self) -> usize {
        self.phases.iter().filter(|p| **p == ResearchPhase::Executing).count()
    }
}

pub struct ResearchEngine {
    oracle: Arc<dyn Oracle>,
    tools: Arc<ToolRegistry>,
    planner: ModelSettings,
    executor: ModelSettings,
    synthesizer: ModelSettings,
    step_budget: u32,
    max_tool_rounds: usize,
    deadline: Option<Duration>,
}

impl ResearchEngine {
    pub fn new(oracle: Arc<dyn Oracle>, tools: Arc<ToolRegistry>, settings: ModelSettings) -> Self {
        Self {
            oracle,
            tools,
            planner: settings.clone(),
            executor: settings.clone(),
            synthesizer: settings,
            step_budget: DEFAULT_STEP_BUDGET,
            max_tool_rounds: 5,
            deadline: None,
        }
    }

    /// Apply the `[research]` config section on top of `settings`.
    pub fn from_config(
        oracle: Arc<dyn Oracle>,
        tools: Arc<ToolRegistry>,
        settings: ModelSettings,
        config: &ResearchConfig,
    ) -> Self {
        let pick = |model: &Option<String>| match model {
            Some(m) => settings.for_model(m),
            None => settings.clone(),
        };
        Self {
            planner: pick(&config.planner_model),
            executor: pick(&config.executor_model),
            synthesizer: pick(&config.synthesis_model),
            step_budget: config.step_budget,
            max_tool_rounds: config.executor_max_tool_rounds,
            deadline: config.deadline_secs.map(Duration::from_secs),
            oracle,
            tools,
        }
    }

    pub fn with_step_budget(mut self, budget: u32) -> Self {
        self.step_budget = budget;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn step_budget(&self) -> u32 {
        self.step_budget
    }

    /// Run one research loop for `objective`, streaming synthesis into `tx`.
    pub async fn run(&self, objective: &str, tx: &ChunkSender) -> ResearchOutcome {
        let started = Instant::now();
        let mut state = PlanState::new(objective);
        let mut phases = Vec::new();
        let mut run_log = vec![Message::user(objective)];
        let mut content = String::new();
        let mut phase = ResearchPhase::Planning;

        loop {
            phases.push(phase);
            debug!(?phase, steps_executed = state.steps_executed, "Research phase");

            phase = match phase {
                ResearchPhase::Planning => {
                    let steps = self.plan(objective).await;
                    info!(steps = steps.len(), "Research plan ready");
                    run_log.push(Message::assistant(format!("Plan:\n{}", format_steps(&steps))));
                    state.replace_plan(steps);
                    self.next_phase(&state, started)
                }

                ResearchPhase::Executing => {
                    if self.deadline_passed(started) {
                        warn!("Research deadline reached, forcing synthesis");
                        ResearchPhase::Synthesizing
                    } else {
                        let plan = state.format_plan();
                        match state.pop_next() {
                            Some(step) => {
                                let result = self.execute(&plan, &step).await;
                                run_log.push(Message::assistant(format!("Step: {step}\nResult: {result}")));
                                state.record(step, result);
                                info!(step = state.steps_executed, budget = self.step_budget, "Research step executed");
                                ResearchPhase::Replanning
                            }
                            None => ResearchPhase::Synthesizing,
                        }
                    }
                }

                ResearchPhase::Replanning => {
                    if self.deadline_passed(started) {
                        warn!("Research deadline reached, forcing synthesis");
                        ResearchPhase::Synthesizing
                    } else {
                        let steps = if state.remaining.is_empty() {
                            debug!("Plan already empty, skipping replan");
                            Vec::new()
                        } else {
                            self.replan(&state).await
                        };
                        state.replace_plan(steps);
                        let next = decide(&state, self.step_budget);
                        if next == ResearchPhase::Synthesizing && !state.remaining.is_empty() {
                            warn!(budget = self.step_budget, "Step budget reached, forcing synthesis");
                        }
                        next
                    }
                }

                ResearchPhase::Synthesizing => {
                    content = self.synthesize(&state, tx).await;
                    run_log.push(Message::assistant(content.clone()));
                    ResearchPhase::Done
                }

                ResearchPhase::Done => break,
            };
        }

        info!(
            steps_executed = state.steps_executed,
            chars = content.len(),
            "Research finished"
        );
        ResearchOutcome {
            state,
            content,
            phases,
            run_log,
        }
    }

    fn deadline_passed(&self, started: Instant) -> bool {
        self.deadline.is_some_and(|d| started.elapsed() >= d)
    }

    fn next_phase(&self, state: &PlanState, started: Instant) -> ResearchPhase {
        if self.deadline_passed(started) {
            return ResearchPhase::Synthesizing;
        }
        decide(state, self.step_budget)
    }

    async fn plan(&self, objective: &str) -> Vec<String> {
        let prompt = format!(
            "For the given objective, come up with a simple step by step plan. Each step should be \
             an individual task that, if executed correctly, moves toward the answer. Do not add \
             superfluous steps, and make sure every step carries the information it needs. The \
             result of the final step should be the final answer.\n\nObjective: {objective}"
        );
        let format = ResponseFormat::new("plan", Plan::schema());
        match invoke_structured::<Plan>(self.oracle.as_ref(), &self.planner, &prompt, &format).await {
            Ok(plan) => plan.steps,
            Err(e) => {
                warn!(error = %e, "Planning failed, continuing with an empty plan");
                Vec::new()
            }
        }
    }

    async fn execute(&self, plan: &str, step: &str) -> String {
        let prompt = format!("Original plan:\n{plan}\n\nExecute step: {step}");
        match invoke_tool_capable(
            self.oracle.as_ref(),
            &self.executor,
            &prompt,
            &self.tools,
            &[],
            self.max_tool_rounds,
        )
        .await
        {
            Ok(completion) => {
                debug!(tool_calls = completion.tool_calls_made, "Step completed");
                completion.content
            }
            Err(e) => {
                warn!(step, error = %e, "Step failed");
                format!("Error executing step: {e}")
            }
        }
    }

    async fn replan(&self, state: &PlanState) -> Vec<String> {
        let prompt = format!(
            "You are refining a research plan. Compare the original objective, the remaining plan \
             and the results of the executed steps.\n\n\
             Original Objective: {}\n\
             Remaining Plan:\n{}\n\
             Executed Steps and Results:\n{}\n\n\
             If the remaining plan still holds the right next steps, return it unchanged. If it \
             needs adjusting, return only the refined future steps. If no more steps are needed, \
             return an empty list of steps.",
            state.objective,
            state.format_plan(),
            state.format_history()
        );
        let format = ResponseFormat::new("plan", Plan::schema());
        match invoke_structured::<Plan>(self.oracle.as_ref(), &self.planner, &prompt, &format).await {
            Ok(plan) => plan.steps,
            Err(e) => {
                warn!(error = %e, "Replanning failed, moving to synthesis");
                Vec::new()
            }
        }
    }

    /// Stream the final report into `tx` and return the text streamed.
    async fn synthesize(&self, state: &PlanState, tx: &ChunkSender) -> String {
        let prompt = format!(
            "You are an expert research analyst. Synthesize the following research notes into a \
             final comprehensive report answering the original objective. Be clear, concise, and \
             directly address the objective.\n\n\
             Original Objective: {}\n\n\
             Research Notes (Executed Steps and Results):\n{}\n\n\
             Final Report:",
            state.objective,
            state.format_notes()
        );

        let mut content = String::new();
        let mut fragments =
            match invoke_streaming(self.oracle.as_ref(), &self.synthesizer, vec![Message::user(prompt)]).await {
                Ok(fragments) => fragments,
                Err(e) => {
                    warn!(error = %e, "Synthesis failed to start");
                    let _ = tx.send(Ok(ResponseChunk::error(format!("Error during final synthesis: {e}")))).await;
                    return content;
                }
            };

        while let Some(item) = fragments.recv().await {
            match item {
                Ok(fragment) => {
                    content.push_str(&fragment);
                    let _ = tx.send(Ok(ResponseChunk::text(fragment))).await;
                }
                Err(e) => {
                    warn!(error = %e, streamed = content.len(), "Synthesis interrupted");
                    let _ = tx.send(Ok(ResponseChunk::error(format!("Error during final synthesis: {e}")))).await;
                    return content;
                }
            }
        }

        if content.is_empty() {
            let _ = tx.send(Ok(ResponseChunk::error(NO_RESPONSE))).await;
        }
        content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::chunk_channel;
    use crate::test_helpers::*;
    use threadloom_core::error::OracleError;
    use threadloom_core::error::ToolError;
    use threadloom_core::tool::{Tool, ToolOutput};

    fn engine(oracle: ScriptedOracle) -> (Arc<ScriptedOracle>, ResearchEngine) {
        let oracle = Arc::new(oracle);
        let engine = ResearchEngine::new(oracle.clone(), Arc::new(ToolRegistry::new()), ModelSettings::new("m"));
        (oracle, engine)
    }

    async fn run(engine: &ResearchEngine, objective: &str) -> (ResearchOutcome, Vec<ResponseChunk>) {
        let (tx, stream) = chunk_channel();
        let outcome = engine.run(objective, &tx).await;
        drop(tx);
        (outcome, collect_chunks(stream).await)
    }

    #[tokio::test]
    async fn two_step_scenario() {
        let (oracle, engine) = engine(
            ScriptedOracle::new()
                .plan(&["a", "b"])
                .reply("result a")
                .plan(&["b"])
                .reply("result b")
                .stream(ScriptedStream::fragments(&["Final ", "report"])),
        );

        let (outcome, chunks) = run(&engine, "X").await;

        assert_eq!(outcome.state.steps_executed, 2);
        assert_eq!(
            outcome.state.history,
            vec![("a".into(), "result a".into()), ("b".into(), "result b".into())]
        );
        assert_eq!(
            outcome.phases,
            vec![
                ResearchPhase::Planning,
                ResearchPhase::Executing,
                ResearchPhase::Replanning,
                ResearchPhase::Executing,
                ResearchPhase::Replanning,
                ResearchPhase::Synthesizing,
                ResearchPhase::Done,
            ]
        );
        assert_eq!(outcome.content, "Final report");
        assert_eq!(text_of(&chunks), "Final report");
        // plan, a, replan, b; the plan is empty after b so no replan call
        assert_eq!(oracle.complete_count(), 4);

        // The executor sees the plan it belongs to
        let prompts = oracle.prompts();
        assert_eq!(prompts[1], "Original plan:\n1. a\n2. b\n\nExecute step: a");
        assert!(prompts[2].contains("Step: a\nResult: result a"));
    }

    #[tokio::test]
    async fn empty_plan_goes_straight_to_synthesis() {
        let (oracle, engine) = engine(
            ScriptedOracle::new()
                .plan(&[])
                .stream(ScriptedStream::fragments(&["Nothing to research."])),
        );

        let (outcome, chunks) = run(&engine, "X").await;

        assert_eq!(outcome.executed_steps(), 0);
        assert_eq!(outcome.state.steps_executed, 0);
        assert_eq!(
            outcome.phases,
            vec![ResearchPhase::Planning, ResearchPhase::Synthesizing, ResearchPhase::Done]
        );
        assert_eq!(text_of(&chunks), "Nothing to research.");
        let synthesis = &oracle.stream_requests()[0].messages[0].content;
        assert!(synthesis.contains("No research results available."));
    }

    #[tokio::test]
    async fn unchanged_plan_keeps_executing() {
        let (_oracle, engine) = engine(
            ScriptedOracle::new()
                .plan(&["a", "b"])
                .reply("ra")
                .plan(&["b"])
                .reply("rb")
                .stream(ScriptedStream::fragments(&["done"])),
        );
        let (outcome, _) = run(&engine, "X").await;
        // The replan after "a" returned the same remaining plan
        assert_eq!(outcome.phases[3], ResearchPhase::Executing);
    }

    #[tokio::test]
    async fn budget_forces_synthesis() {
        let (oracle, engine) = engine(
            ScriptedOracle::new()
                .plan(&["a", "b", "c"])
                .reply("ra")
                .plan(&["b", "c"])
                .reply("rb")
                .plan(&["c"])
                .stream(ScriptedStream::fragments(&["partial answer"])),
        );
        let engine = engine.with_step_budget(2);

        let (outcome, chunks) = run(&engine, "X").await;

        assert_eq!(outcome.state.steps_executed, 2);
        assert_eq!(outcome.state.remaining, vec!["c".to_string()]);
        assert_eq!(outcome.executed_steps(), 2);
        assert_eq!(text_of(&chunks), "partial answer");
        assert_eq!(oracle.complete_count(), 5);
    }

    #[tokio::test]
    async fn counter_never_exceeds_budget() {
        for budget in 1..=4 {
            let mut oracle = ScriptedOracle::new().plan(&["s"; 6]);
            for _ in 0..6 {
                oracle = oracle.reply("r").plan(&["s"; 6]);
            }
            let (_, engine) = engine(oracle.stream(ScriptedStream::fragments(&["ok"])));
            let engine = engine.with_step_budget(budget);
            let (outcome, _) = run(&engine, "X").await;
            assert_eq!(outcome.state.steps_executed, budget);
        }
    }

    #[tokio::test]
    async fn planning_failure_routes_to_synthesis() {
        let (_, engine) = engine(
            ScriptedOracle::new()
                .fail(OracleError::Timeout("planner".into()))
                .stream(ScriptedStream::fragments(&["Sorry, I could not research that."])),
        );
        let (outcome, chunks) = run(&engine, "X").await;
        assert_eq!(outcome.state.steps_executed, 0);
        assert!(outcome.state.history.is_empty());
        assert_eq!(text_of(&chunks), "Sorry, I could not research that.");
    }

    #[tokio::test]
    async fn malformed_plan_counts_as_empty() {
        let (_, engine) = engine(
            ScriptedOracle::new()
                .reply("here is my plan: step one")
                .stream(ScriptedStream::fragments(&["ok"])),
        );
        let (outcome, _) = run(&engine, "X").await;
        assert_eq!(outcome.executed_steps(), 0);
    }

    #[tokio::test]
    async fn failed_step_is_recorded_and_loop_continues() {
        let (_, engine) = engine(
            ScriptedOracle::new()
                .plan(&["a", "b"])
                .fail(OracleError::RateLimited { retry_after_secs: 1 })
                .plan(&["b"])
                .reply("rb")
                .stream(ScriptedStream::fragments(&["done"])),
        );
        let (outcome, _) = run(&engine, "X").await;
        assert_eq!(outcome.state.steps_executed, 2);
        assert!(outcome.state.history[0].1.starts_with("Error executing step:"));
        assert_eq!(outcome.state.history[1].1, "rb");
    }

    #[tokio::test]
    async fn replanning_failure_forces_synthesis() {
        let (oracle, engine) = engine(
            ScriptedOracle::new()
                .plan(&["a", "b"])
                .reply("ra")
                .fail(OracleError::Network("reset".into()))
                .stream(ScriptedStream::fragments(&["summary"])),
        );
        let (outcome, chunks) = run(&engine, "X").await;
        assert_eq!(outcome.state.steps_executed, 1);
        assert_eq!(text_of(&chunks), "summary");
        assert_eq!(oracle.complete_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_plan_skips_replan_call() {
        let (oracle, engine) = engine(
            ScriptedOracle::new()
                .plan(&["only"])
                .reply("r")
                .stream(ScriptedStream::fragments(&["ok"])),
        );
        let (outcome, _) = run(&engine, "X").await;
        assert_eq!(outcome.state.steps_executed, 1);
        // plan + execute, no replan call
        assert_eq!(oracle.complete_count(), 2);
    }

    #[tokio::test]
    async fn synthesis_failure_keeps_partial_text() {
        let (_, engine) = engine(ScriptedOracle::new().plan(&[]).stream(ScriptedStream::failing_after(
            &["one ", "two"],
            OracleError::StreamInterrupted("connection reset".into()),
        )));

        let (outcome, chunks) = run(&engine, "X").await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], ResponseChunk::text("one "));
        assert_eq!(chunks[1], ResponseChunk::text("two"));
        assert!(matches!(&chunks[2], ResponseChunk::Error { message } if message.contains("connection reset")));
        assert_eq!(outcome.content, "one two");
        assert_eq!(outcome.phases.last(), Some(&ResearchPhase::Done));
    }

    #[tokio::test]
    async fn silent_synthesis_reports_no_response() {
        let (_, engine) = engine(ScriptedOracle::new().plan(&[]).stream(ScriptedStream::default()));
        let (_, chunks) = run(&engine, "X").await;
        assert_eq!(chunks, vec![ResponseChunk::error(NO_RESPONSE)]);
    }

    #[tokio::test]
    async fn elapsed_deadline_short_circuits() {
        let (oracle, engine) = engine(
            ScriptedOracle::new()
                .plan(&["a", "b"])
                .stream(ScriptedStream::fragments(&["late"])),
        );
        let engine = engine.with_deadline(Duration::ZERO);
        let (outcome, chunks) = run(&engine, "X").await;
        assert_eq!(outcome.state.steps_executed, 0);
        assert_eq!(oracle.complete_count(), 1);
        assert_eq!(text_of(&chunks), "late");
    }

    struct CountingSearch;

    #[async_trait::async_trait]
    impl Tool for CountingSearch {
        fn name(&self) -> &str {
            "web_search"
        }
        fn description(&self) -> &str {
            "search"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("population: 5.5 million"))
        }
    }

    #[tokio::test]
    async fn executor_uses_tools() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .plan(&["find population"])
                .tool_calls(vec![make_tool_call("web_search", serde_json::json!({"query": "population"}))])
                .reply("5.5 million")
                .stream(ScriptedStream::fragments(&["About 5.5 million."])),
        );
        let tools = Arc::new(ToolRegistry::new().with(Box::new(CountingSearch)));
        let engine = ResearchEngine::new(oracle.clone(), tools, ModelSettings::new("m"));

        let (outcome, _) = run(&engine, "population of Finland").await;

        assert_eq!(outcome.state.history[0].1, "5.5 million");
        let requests = oracle.requests();
        assert!(!requests[1].tools.is_empty());
        assert!(requests[2].messages.iter().any(|m| m.content.contains("5.5 million")));
    }

    #[test]
    fn config_selects_models() {
        let config = ResearchConfig {
            planner_model: Some("planner".into()),
            step_budget: 4,
            ..ResearchConfig::default()
        };
        let engine = ResearchEngine::from_config(
            Arc::new(ScriptedOracle::new()),
            Arc::new(ToolRegistry::new()),
            ModelSettings::new("base"),
            &config,
        );
        assert_eq!(engine.planner.model, "planner");
        assert_eq!(engine.executor.model, "base");
        assert_eq!(engine.step_budget(), 4);
    }
}
