//! Human approval gates.
//!
//! A gate blocks the calling phase until a decision comes back. Transport lives
//! behind [`ApprovalGateway`]; [`ConsoleGateway`] is the terminal implementation.
//! Callers go through [`decide`], which applies the one fallback policy used for
//! every gate: when a decision cannot be obtained, resolve to the choice set's
//! non-destructive default.

use std::cell::RefCell;
use std::io::{BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::cancel::{CancelToken, Cancelled, is_cancelled};

/// Shape of the answer a gate accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceSet {
    /// Approve, or reject with free-text feedback.
    Binary {
        approve_label: String,
        reject_label: String,
    },
    /// Two or three labelled options mapping to `ChoiceA`/`ChoiceB`/`ChoiceC` in order.
    /// `ChoiceA` must be the non-destructive option.
    Labelled(Vec<String>),
    /// A single free-text answer.
    FreeText,
}

impl ChoiceSet {
    pub fn binary(approve_label: &str, reject_label: &str) -> Self {
        ChoiceSet::Binary {
            approve_label: approve_label.to_string(),
            reject_label: reject_label.to_string(),
        }
    }

    pub fn labelled<S: AsRef<str>>(labels: &[S]) -> Self {
        ChoiceSet::Labelled(labels.iter().map(|l| l.as_ref().to_string()).collect())
    }

    /// Labels as sent over the gateway protocol.
    pub fn choice_labels(&self) -> Vec<String> {
        match self {
            ChoiceSet::Binary {
                approve_label,
                reject_label,
            } => vec![approve_label.clone(), reject_label.clone()],
            ChoiceSet::Labelled(labels) => labels.clone(),
            ChoiceSet::FreeText => Vec::new(),
        }
    }

    /// True when `outcome` is one of the answers this set offers.
    pub fn allows(&self, outcome: DecisionOutcome) -> bool {
        match self {
            ChoiceSet::Binary { .. } => {
                matches!(outcome, DecisionOutcome::Approve | DecisionOutcome::Reject)
            }
            ChoiceSet::Labelled(labels) => (0..labels.len())
                .any(|idx| DecisionOutcome::from_choice_index(idx) == Some(outcome)),
            ChoiceSet::FreeText => outcome == DecisionOutcome::Approve,
        }
    }

    /// Outcome used when the gateway fails to produce a decision.
    pub fn fallback_outcome(&self) -> DecisionOutcome {
        match self {
            ChoiceSet::Binary { .. } | ChoiceSet::FreeText => DecisionOutcome::Approve,
            ChoiceSet::Labelled(_) => DecisionOutcome::ChoiceA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approve,
    Reject,
    ChoiceA,
    ChoiceB,
    ChoiceC,
}

impl DecisionOutcome {
    /// Labelled outcome for a 0-based option index.
    pub fn from_choice_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(DecisionOutcome::ChoiceA),
            1 => Some(DecisionOutcome::ChoiceB),
            2 => Some(DecisionOutcome::ChoiceC),
            _ => None,
        }
    }
}

/// A question put to a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub prompt: String,
    pub context: String,
    pub choices: ChoiceSet,
}

impl ApprovalRequest {
    pub fn new(
        request_id: String,
        prompt: impl Into<String>,
        context: impl Into<String>,
        choices: ChoiceSet,
    ) -> Self {
        Self {
            request_id,
            prompt: prompt.into(),
            context: context.into(),
            choices,
        }
    }
}

/// The answer to an [`ApprovalRequest`]. Free-text gates answer with `Approve`
/// and carry the text in `free_text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub request_id: String,
    pub outcome: DecisionOutcome,
    #[serde(default)]
    pub free_text: Option<String>,
}

impl ApprovalDecision {
    pub fn new(request_id: &str, outcome: DecisionOutcome, free_text: Option<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            outcome,
            free_text,
        }
    }

    /// Trimmed free text, empty when none was given.
    pub fn feedback(&self) -> &str {
        self.free_text.as_deref().map(str::trim).unwrap_or_default()
    }
}

/// Transport for human decisions.
pub trait ApprovalGateway {
    /// Block until a human answers `request`.
    ///
    /// Must return `Cancelled` (not a generic error) when the token fires while waiting.
    fn request_decision(
        &self,
        request: &ApprovalRequest,
        cancel: &CancelToken,
    ) -> Result<ApprovalDecision>;
}

/// `<phase>_<detail>_<unix-nanos>`.
pub fn request_id(phase: &str, detail: impl std::fmt::Display) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{phase}_{detail}_{nanos}")
}

/// Ask `gateway`, resolving any non-cancellation failure to the fallback outcome.
///
/// A decision for another request, or with an outcome the choice set does not
/// offer, counts as a failure.
pub fn decide<G: ApprovalGateway + ?Sized>(
    gateway: &G,
    request: &ApprovalRequest,
    cancel: &CancelToken,
) -> Result<ApprovalDecision> {
    cancel.check()?;
    let answer = gateway
        .request_decision(request, cancel)
        .and_then(|decision| check_decision(request, decision));
    match answer {
        Ok(decision) => {
            debug!(request_id = %request.request_id, outcome = ?decision.outcome, "gate decided");
            Ok(decision)
        }
        Err(err) if is_cancelled(&err) => Err(err),
        Err(err) => {
            let outcome = request.choices.fallback_outcome();
            warn!(
                request_id = %request.request_id,
                err = %format!("{err:#}"),
                fallback = ?outcome,
                "gateway failed, using fallback decision"
            );
            Ok(ApprovalDecision::new(&request.request_id, outcome, None))
        }
    }
}

fn check_decision(request: &ApprovalRequest, decision: ApprovalDecision) -> Result<ApprovalDecision> {
    if decision.request_id != request.request_id {
        bail!(
            "decision answers {} instead of {}",
            decision.request_id,
            request.request_id
        );
    }
    if !request.choices.allows(decision.outcome) {
        bail!("{:?} is not an answer to this gate", decision.outcome);
    }
    Ok(decision)
}

/// Line-oriented gateway over any reader/writer pair (stdin/stdout in the CLI).
///
/// Answering `abort` to any question raises the cancel token.
pub struct ConsoleGateway<R: BufRead, W: Write> {
    input: RefCell<R>,
    output: RefCell<W>,
}

impl<R: BufRead, W: Write> ConsoleGateway<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input: RefCell::new(input),
            output: RefCell::new(output),
        }
    }

    pub fn into_output(self) -> W {
        self.output.into_inner()
    }

    fn say(&self, text: &str) -> Result<()> {
        let mut out = self.output.borrow_mut();
        out.write_all(text.as_bytes()).context("write console")?;
        out.flush().context("flush console")
    }

    fn read_answer(&self, cancel: &CancelToken) -> Result<String> {
        let mut line = String::new();
        let n = self
            .input
            .borrow_mut()
            .read_line(&mut line)
            .context("read console")?;
        if n == 0 {
            return Err(anyhow!("console input closed"));
        }
        let answer = line.trim().to_string();
        if answer.eq_ignore_ascii_case("abort") {
            cancel.cancel();
            return Err(Cancelled.into());
        }
        cancel.check()?;
        Ok(answer)
    }

    fn render(&self, request: &ApprovalRequest) -> Result<()> {
        let mut text = format!("\n== {} ==\n", request.prompt);
        if !request.context.trim().is_empty() {
            text.push_str(request.context.trim_end());
            text.push('\n');
        }
        match &request.choices {
            ChoiceSet::Binary {
                approve_label,
                reject_label,
            } => text.push_str(&format!("[y] {approve_label}  [n] {reject_label}\n")),
            ChoiceSet::Labelled(labels) => {
                for (idx, label) in labels.iter().enumerate() {
                    text.push_str(&format!("[{}] {label}\n", idx + 1));
                }
            }
            ChoiceSet::FreeText => {}
        }
        text.push_str("> ");
        self.say(&text)
    }
}

impl<R: BufRead, W: Write> ApprovalGateway for ConsoleGateway<R, W> {
    fn request_decision(
        &self,
        request: &ApprovalRequest,
        cancel: &CancelToken,
    ) -> Result<ApprovalDecision> {
        self.render(request)?;
        loop {
            let answer = self.read_answer(cancel)?;
            match &request.choices {
                ChoiceSet::FreeText => {
                    let text = (!answer.is_empty()).then_some(answer);
                    return Ok(ApprovalDecision::new(
                        &request.request_id,
                        DecisionOutcome::Approve,
                        text,
                    ));
                }
                ChoiceSet::Binary { .. } => match answer.to_ascii_lowercase().as_str() {
                    "y" | "yes" | "approve" => {
                        return Ok(ApprovalDecision::new(
                            &request.request_id,
                            DecisionOutcome::Approve,
                            None,
                        ));
                    }
                    "n" | "no" | "reject" => {
                        self.say("Feedback: ")?;
                        let feedback = self.read_answer(cancel)?;
                        return Ok(ApprovalDecision::new(
                            &request.request_id,
                            DecisionOutcome::Reject,
                            (!feedback.is_empty()).then_some(feedback),
                        ));
                    }
                    _ => self.say("Answer y or n (or abort): ")?,
                },
                ChoiceSet::Labelled(labels) => {
                    let picked = answer
                        .parse::<usize>()
                        .ok()
                        .filter(|n| (1..=labels.len()).contains(n))
                        .and_then(|n| DecisionOutcome::from_choice_index(n - 1));
                    match picked {
                        Some(outcome) => {
                            return Ok(ApprovalDecision::new(
                                &request.request_id,
                                outcome,
                                None,
                            ));
                        }
                        None => self.say(&format!(
                            "Answer a number from 1 to {} (or abort): ",
                            labels.len()
                        ))?,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn console(input: &str) -> ConsoleGateway<Cursor<Vec<u8>>, Vec<u8>> {
        ConsoleGateway::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    fn binary_request() -> ApprovalRequest {
        ApprovalRequest::new(
            request_id("plan_approval", 1),
            "Approve this plan?",
            "## Step 1: Inspect",
            ChoiceSet::binary("Approve plan", "Request changes"),
        )
    }

    struct FailingGateway;

    impl ApprovalGateway for FailingGateway {
        fn request_decision(
            &self,
            _request: &ApprovalRequest,
            _cancel: &CancelToken,
        ) -> Result<ApprovalDecision> {
            Err(anyhow!("channel closed"))
        }
    }

    /// Answers every request with the same decision.
    struct FixedGateway(ApprovalDecision);

    impl ApprovalGateway for FixedGateway {
        fn request_decision(
            &self,
            _request: &ApprovalRequest,
            _cancel: &CancelToken,
        ) -> Result<ApprovalDecision> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn binary_reject_collects_feedback_after_reprompt() {
        let gateway = console("maybe\nn\nsplit step 2\n");
        let decision = gateway
            .request_decision(&binary_request(), &CancelToken::new())
            .expect("decision");
        assert_eq!(decision.outcome, DecisionOutcome::Reject);
        assert_eq!(decision.feedback(), "split step 2");

        let transcript = String::from_utf8(gateway.into_output()).expect("utf8");
        assert!(transcript.contains("Approve this plan?"));
        assert!(transcript.contains("Answer y or n"));
    }

    #[test]
    fn labelled_answers_map_to_choices() {
        let request = ApprovalRequest::new(
            request_id("resume", "step_2"),
            "Resume?",
            "",
            ChoiceSet::labelled(&["Resume", "Start over", "Fast execute"]),
        );
        let decision = console("4\n3\n")
            .request_decision(&request, &CancelToken::new())
            .expect("decision");
        assert_eq!(decision.outcome, DecisionOutcome::ChoiceC);
    }

    #[test]
    fn abort_raises_the_token() {
        let cancel = CancelToken::new();
        let err = console("abort\n")
            .request_decision(&binary_request(), &cancel)
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn closed_input_falls_back_through_decide() {
        let decision =
            decide(&console(""), &binary_request(), &CancelToken::new()).expect("fallback");
        assert_eq!(decision.outcome, DecisionOutcome::Approve);
        assert!(decision.free_text.is_none());
    }

    #[test]
    fn labelled_fallback_is_choice_a() {
        let request = ApprovalRequest::new(
            request_id("existing_plan", "decision"),
            "Plan exists",
            "",
            ChoiceSet::labelled(&["Use existing plan", "Create new plan", "Update plan"]),
        );
        let decision = decide(&FailingGateway, &request, &CancelToken::new()).expect("fallback");
        assert_eq!(decision.outcome, DecisionOutcome::ChoiceA);
    }

    #[test]
    fn out_of_set_outcome_resolves_to_fallback() {
        let request = binary_request();
        let gateway = FixedGateway(ApprovalDecision::new(
            &request.request_id,
            DecisionOutcome::ChoiceB,
            Some("ignored".to_string()),
        ));
        let decision = decide(&gateway, &request, &CancelToken::new()).expect("fallback");
        assert_eq!(decision.outcome, DecisionOutcome::Approve);
        assert!(decision.free_text.is_none());

        let request = ApprovalRequest::new(
            request_id("step_reexecute", 1),
            "Re-execute?",
            "",
            ChoiceSet::labelled(&["Stop", "Re-execute"]),
        );
        let gateway = FixedGateway(ApprovalDecision::new(
            &request.request_id,
            DecisionOutcome::ChoiceC,
            None,
        ));
        let decision = decide(&gateway, &request, &CancelToken::new()).expect("fallback");
        assert_eq!(decision.outcome, DecisionOutcome::ChoiceA);
    }

    #[test]
    fn decision_for_another_request_resolves_to_fallback() {
        let request = ApprovalRequest::new(
            "existing_plan_decision_1".to_string(),
            "Plan exists",
            "",
            ChoiceSet::labelled(&["Use existing plan", "Create new plan"]),
        );
        let stale = FixedGateway(ApprovalDecision::new(
            "existing_plan_decision_0",
            DecisionOutcome::ChoiceB,
            None,
        ));
        let decision = decide(&stale, &request, &CancelToken::new()).expect("fallback");
        assert_eq!(decision.outcome, DecisionOutcome::ChoiceA);
        assert_eq!(decision.request_id, request.request_id);

        let matching = FixedGateway(ApprovalDecision::new(
            &request.request_id,
            DecisionOutcome::ChoiceB,
            None,
        ));
        let decision = decide(&matching, &request, &CancelToken::new()).expect("decision");
        assert_eq!(decision.outcome, DecisionOutcome::ChoiceB);
    }

    #[test]
    fn choice_sets_allow_only_their_outcomes() {
        let binary = ChoiceSet::binary("Approve", "Reject");
        assert!(binary.allows(DecisionOutcome::Reject));
        assert!(!binary.allows(DecisionOutcome::ChoiceA));
        let two = ChoiceSet::labelled(&["Stop", "Go"]);
        assert!(two.allows(DecisionOutcome::ChoiceB));
        assert!(!two.allows(DecisionOutcome::ChoiceC));
        assert!(!two.allows(DecisionOutcome::Approve));
        assert!(!ChoiceSet::FreeText.allows(DecisionOutcome::Reject));
    }

    #[test]
    fn decide_propagates_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = decide(&FailingGateway, &binary_request(), &cancel).unwrap_err();
        assert!(is_cancelled(&err));
    }

    #[test]
    fn request_ids_carry_phase_and_detail() {
        let id = request_id("step_feedback", "3");
        assert!(id.starts_with("step_feedback_3_"));
    }
}
