//! Investigation handlers backed by [`AnalysisDriver`] — the concrete work
//! behind each [`HandlerFn`] slot in [`QuestionHandlers`].

use std::sync::Arc;

use synapse_runtime::investigator::{HandlerFn, InvestigationOutcome, QuestionHandlers};
use synapse_runtime::llm_driver::{AnalysisDriver, ChatMessage, LlmError, Role};
use synapse_types::CuriosityQuestion;

fn prompt_for(system: &str, question: &CuriosityQuestion) -> Vec<ChatMessage> {
    let evidence = if question.evidence.is_empty() { "(none)".to_string() } else { question.evidence.join("\n") };
    vec![
        ChatMessage { role: Role::System, content: system.to_string() },
        ChatMessage {
            role: Role::User,
            content: format!(
                "Hypothesis: {}\nQuestion: {}\nEvidence:\n{}",
                question.hypothesis, question.question, evidence
            ),
        },
    ]
}

fn outcome_from_result(model: &str, result: Result<(String, u64), LlmError>) -> InvestigationOutcome {
    match result {
        Ok((reply, tokens)) => InvestigationOutcome::completed(vec![reply], model, tokens),
        Err(e) => InvestigationOutcome::failed(e.to_string()),
    }
}

fn module_handler(driver: Arc<AnalysisDriver>, model: Arc<str>) -> HandlerFn {
    Arc::new(move |question| {
        let driver = driver.clone();
        let model = model.clone();
        Box::pin(async move {
            let messages = prompt_for(
                "You analyze an undocumented or under-investigated source module and explain what it does and whether it should be indexed.",
                &question,
            );
            outcome_from_result(&model, driver.complete(&messages).await)
        })
    })
}

fn systemd_handler(driver: Arc<AnalysisDriver>, model: Arc<str>) -> HandlerFn {
    Arc::new(move |question| {
        let driver = driver.clone();
        let model = model.clone();
        Box::pin(async move {
            let messages = prompt_for(
                "You analyze a disabled or misbehaving systemd unit and recommend whether it is safe to leave disabled.",
                &question,
            );
            outcome_from_result(&model, driver.complete(&messages).await)
        })
    })
}

fn generic_handler(driver: Arc<AnalysisDriver>, model: Arc<str>) -> HandlerFn {
    Arc::new(move |question| {
        let driver = driver.clone();
        let model = model.clone();
        Box::pin(async move {
            let messages = prompt_for(
                "You investigate an anomaly surfaced by the introspection core and propose a diagnosis grounded in the given evidence.",
                &question,
            );
            outcome_from_result(&model, driver.complete(&messages).await)
        })
    })
}

/// Build the three handler slots the worker pool routes questions to, all
/// sharing one [`AnalysisDriver`]. `model` labels the [`InvestigationOutcome`]
/// on success (the driver itself does not expose its configured model name).
pub fn build(driver: Arc<AnalysisDriver>, model: impl Into<String>) -> QuestionHandlers {
    let model: Arc<str> = Arc::from(model.into());
    QuestionHandlers {
        module: module_handler(driver.clone(), model.clone()),
        systemd: systemd_handler(driver.clone(), model.clone()),
        generic: generic_handler(driver, model),
    }
}
