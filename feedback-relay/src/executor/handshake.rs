//! The handshake form filler.
//!
//! Stages run strictly in order, each under its own retry budget. A stage that mutates the
//! page never claims success on the same attempt: it performs the write, submits, and lets a
//! later attempt observe the verification region re-render. Re-running a stage whose effect
//! is already visible performs no mutation.

use std::fmt;

use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::Message;
use crate::config::AppConfig;
use crate::constants::{
    est_time, qa_feedback, tasks, NON_OTHER_TASK_SIGNATURE, OTHER_TASK_NAME,
    VERIFICATION_QUERY_SELECTOR,
};
use crate::errors::RelayError;
use crate::page::Page;
use crate::poll::{retry_step, wait_for_condition, DEFAULT_POLL_STEP};
use crate::session::SessionToken;
use crate::types::{extract_task_id, Ratings, TaskIdentity};

/// Index of the input written by every field step.
const FIELD_INPUT_INDEX: usize = 0;

/// Everything the executor needs for one run, as carried by `WRITE_HANDSHAKE`.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeJob {
    pub config: AppConfig,
    pub task: TaskIdentity,
    pub ratings: Ratings,
}

impl HandshakeJob {
    /// Decodes `[configs, taskId, taskSlug, ratings]`.
    pub fn from_message(message: &Message) -> Result<Self, RelayError> {
        let (config, id, slug, ratings): (AppConfig, String, String, Ratings) =
            message.payload()?;
        config.validate()?;
        Ok(Self {
            config,
            task: TaskIdentity { id, slug },
            ratings,
        })
    }

    pub fn to_payload(&self) -> Result<Value, RelayError> {
        Ok(serde_json::to_value((
            &self.config,
            &self.task.id,
            &self.task.slug,
            &self.ratings,
        ))?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingField {
    Average,
    Exceptional,
    MeetsExpectations,
    SomeIssues,
    MajorIssues,
}

impl RatingField {
    /// Order in which the form asks for the ratings.
    pub const ORDER: [RatingField; 5] = [
        RatingField::Average,
        RatingField::Exceptional,
        RatingField::MeetsExpectations,
        RatingField::SomeIssues,
        RatingField::MajorIssues,
    ];

    /// The value as typed into the form.
    pub fn text(&self, ratings: &Ratings) -> String {
        match self {
            RatingField::Average => ratings.average.to_string(),
            RatingField::Exceptional => ratings.exceptional.to_string(),
            RatingField::MeetsExpectations => ratings.meets_expectations.to_string(),
            RatingField::SomeIssues => ratings.some_issues.to_string(),
            RatingField::MajorIssues => ratings.major_issues.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RatingField::Average => "average",
            RatingField::Exceptional => "exceptional",
            RatingField::MeetsExpectations => "meets expectations",
            RatingField::SomeIssues => "some issues",
            RatingField::MajorIssues => "major issues",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    SkipLimitSection,
    SelectTask,
    SubmitSlug,
    SubmitRating(RatingField),
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeStage::SkipLimitSection => write!(f, "Skip task limit section"),
            HandshakeStage::SelectTask => write!(f, "Task selection"),
            HandshakeStage::SubmitSlug => write!(f, "Set full task slug"),
            HandshakeStage::SubmitRating(field) => write!(f, "Set {} rating", field.label()),
        }
    }
}

/// Values the verification region is expected to show, in order.
///
/// The baseline holds the selected task, the first entry of the region once the write phase
/// starts; `written` grows by one for every confirmed field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationHistory {
    baseline: Vec<String>,
    written: Vec<String>,
}

impl ValidationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_baseline(baseline: Vec<String>) -> Self {
        Self {
            baseline,
            written: Vec::new(),
        }
    }

    pub fn baseline(&self) -> &[String] {
        &self.baseline
    }

    pub fn written(&self) -> &[String] {
        &self.written
    }

    pub fn len(&self) -> usize {
        self.written.len()
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }

    pub fn push(&mut self, value: impl Into<String>) {
        self.written.push(value.into());
    }

    /// Everything expected once `value` has been written too.
    pub fn extended(&self, value: &str) -> Vec<String> {
        self.baseline
            .iter()
            .chain(self.written.iter())
            .cloned()
            .chain(std::iter::once(value.to_string()))
            .collect()
    }
}

/// The region shows `expected` when its first entries equal it, in order.
pub fn region_matches(region: &[String], expected: &[String]) -> bool {
    region.len() >= expected.len() && expected.iter().zip(region).all(|(e, r)| e == r)
}

/// One execution of the handshake state machine inside the destination page.
pub struct HandshakeRun<'a> {
    page: &'a dyn Page,
    job: &'a HandshakeJob,
    history: ValidationHistory,
    session: Uuid,
}

impl<'a> HandshakeRun<'a> {
    pub fn new(page: &'a dyn Page, job: &'a HandshakeJob, session: &SessionToken) -> Self {
        Self {
            page,
            job,
            history: ValidationHistory::new(),
            session: session.id(),
        }
    }

    /// Runs every stage in order and returns the confirmed history.
    pub async fn execute(mut self) -> Result<ValidationHistory, RelayError> {
        info!(
            session = %self.session,
            task_id = %self.job.task.id,
            ratings = ?self.job.ratings,
            "Starting handshake"
        );
        self.run_stage(HandshakeStage::SkipLimitSection).await?;
        info!("Skipped task limit section successfully.");
        self.run_stage(HandshakeStage::SelectTask).await?;
        info!("Submitted task selection. Proceeding to ratings...");

        let mut baseline = self.region_entries().await?;
        if baseline.is_empty() {
            error!("Could not find validation history when submitting task details.");
            return Err(RelayError::ResourceNotFound(
                "verification region is empty after task selection".into(),
            ));
        }
        // Entries past the selected task come from an earlier run and are matched field by field.
        baseline.truncate(1);
        self.history = ValidationHistory::with_baseline(baseline);

        let slug = self.slug_to_submit();
        info!(slug = %slug, "Submitting task details");
        self.run_stage(HandshakeStage::SubmitSlug).await?;
        self.history.push(slug);

        for field in RatingField::ORDER {
            self.run_stage(HandshakeStage::SubmitRating(field)).await?;
            self.history.push(field.text(&self.job.ratings));
        }
        info!(session = %self.session, written = self.history.len(), "Handshake complete");
        Ok(self.history)
    }

    pub fn history(&self) -> &ValidationHistory {
        &self.history
    }

    async fn run_stage(&self, stage: HandshakeStage) -> Result<(), RelayError> {
        let config = &self.job.config;
        let this = self;
        let description = stage.to_string();
        retry_step(
            move || this.attempt(stage),
            config.ep_max_tries,
            config.ep_interval(),
            &description,
        )
        .await
        .map_err(|e| {
            error!(session = %self.session, stage = %stage, "Stage failed: {}", e);
            e.with_context(stage)
        })
    }

    /// One attempt at a stage: `Ok(true)` done, `Ok(false)` check again later.
    pub async fn attempt(&self, stage: HandshakeStage) -> Result<bool, RelayError> {
        self.ensure_on_task_page().await?;
        match stage {
            HandshakeStage::SkipLimitSection => self.skip_limit_section().await,
            HandshakeStage::SelectTask => self.select_task().await,
            HandshakeStage::SubmitSlug => {
                let slug = self.slug_to_submit();
                self.write_field(&slug, tasks::SLUG_INPUT_QUERY_SELECTOR, FIELD_INPUT_INDEX)
                    .await
            }
            HandshakeStage::SubmitRating(field) => {
                let value = field.text(&self.job.ratings);
                self.write_field(
                    &value,
                    qa_feedback::ratings::INPUT_QUERY_SELECTOR,
                    FIELD_INPUT_INDEX,
                )
                .await
            }
        }
    }

    async fn ensure_on_task_page(&self) -> Result<(), RelayError> {
        let location = self.page.location().await?;
        if location.trim().starts_with(tasks::HANDSHAKE_PREFIX) {
            Ok(())
        } else {
            Err(RelayError::StaleState(format!(
                "page navigated away to {location}"
            )))
        }
    }

    async fn region_entries(&self) -> Result<Vec<String>, RelayError> {
        self.page.texts(VERIFICATION_QUERY_SELECTOR).await
    }

    fn slug_to_submit(&self) -> String {
        match self.history.baseline().first() {
            Some(first) if first.trim() == OTHER_TASK_NAME => self.job.task.slug.clone(),
            _ => NON_OTHER_TASK_SIGNATURE.to_string(),
        }
    }

    async fn skip_limit_section(&self) -> Result<bool, RelayError> {
        let options = self.page.count(tasks::OPTIONS_QUERY_SELECTOR).await?;
        if options > est_time::NUM_NON_TASK_BUTTONS {
            return Ok(true);
        }
        if let Err(e) = self.page.click(est_time::CONTINUE_BTN_QUERY_SELECTOR, 0).await {
            warn!("Could not skip task limit section: {}", e);
        }
        Ok(false)
    }

    async fn select_task(&self) -> Result<bool, RelayError> {
        if !self.region_entries().await?.is_empty() {
            return Ok(true);
        }
        let labels = self.page.texts(tasks::OPTIONS_QUERY_SELECTOR).await?;
        if labels.is_empty() {
            error!("No toggle buttons found.");
            return Err(RelayError::ResourceNotFound("no task options found".into()));
        }
        let target = self.job.task.id.as_str();
        let matching = labels.iter().position(|label| {
            extract_task_id(&format!("/tasks/{label}")).as_deref() == Some(target)
        });
        match matching {
            Some(index) => {
                info!("Selecting task: {}", target);
                let pressed = self
                    .page
                    .attribute(tasks::OPTIONS_QUERY_SELECTOR, index, "aria-pressed")
                    .await?;
                if pressed.as_deref() == Some("false") {
                    self.page.click(tasks::OPTIONS_QUERY_SELECTOR, index).await?;
                }
            }
            None => {
                info!("No task matching {}. Selecting last available option.", target);
                if let Err(e) = self
                    .page
                    .click(tasks::OPTIONS_QUERY_SELECTOR, labels.len() - 1)
                    .await
                {
                    error!("Could not select fallback task: {}", e);
                    return Err(e);
                }
            }
        }
        self.perform_submit().await;
        // Selection is confirmed by a later attempt once the region renders.
        Ok(false)
    }

    /// Writes `value` unless the region already shows it after the history.
    async fn write_field(
        &self,
        value: &str,
        input_selector: &str,
        input_index: usize,
    ) -> Result<bool, RelayError> {
        let expected = self.history.extended(value);
        let region = self.region_entries().await?;
        if region_matches(&region, &expected) {
            debug!(value, "Field already written");
            return Ok(true);
        }

        let page = self.page;
        let input_ready = wait_for_condition(
            move || async move { page.count(input_selector).await.map(|n| n > input_index) },
            self.job.config.ep_timeout(),
            DEFAULT_POLL_STEP,
        )
        .await;
        if !input_ready {
            warn!("Input at index {} not found.", input_index);
            return Err(RelayError::ResourceNotFound(format!(
                "input {input_selector} at index {input_index}"
            )));
        }

        self.page.set_value(input_selector, input_index, value).await?;
        self.page
            .dispatch_event(input_selector, input_index, "input")
            .await?;
        self.page
            .dispatch_event(input_selector, input_index, "change")
            .await?;
        self.perform_submit().await;
        Ok(false)
    }

    /// Clicks submit once it is enabled. A submit that never becomes ready is logged only;
    /// the caller's next attempt notices the missing effect.
    async fn perform_submit(&self) -> bool {
        let page = self.page;
        let ready = wait_for_condition(
            move || async move {
                page.attribute(tasks::SUBMIT_BTN_QUERY_SELECTOR, 0, "aria-disabled")
                    .await
                    .map(|v| v.as_deref() == Some("false"))
            },
            self.job.config.ep_timeout(),
            DEFAULT_POLL_STEP,
        )
        .await;
        if !ready {
            warn!("Submit button never became ready.");
            return false;
        }
        match self.page.click(tasks::SUBMIT_BTN_QUERY_SELECTOR, 0).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Error clicking submit: {}", e);
                false
            }
        }
    }
}
