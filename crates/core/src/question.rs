/// What the orchestrator remembers about the conversation around the current interruption.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuestionContext {
    pub last_question: Option<String>,
    pub last_context: Option<String>,
    pub last_answer: Option<String>,
    /// The next dispatched question builds on the previous exchange.
    pub pending_followup: bool,
}

impl QuestionContext {
    /// Context to reuse for a follow-up, so it is not fetched again.
    pub fn cached_context(&self) -> Option<&str> {
        if self.pending_followup {
            self.last_context.as_deref()
        } else {
            None
        }
    }

    /// The exchange a follow-up refers back to.
    pub fn previous_exchange(&self) -> Option<(&str, Option<&str>)> {
        if !self.pending_followup {
            return None;
        }
        self.last_question
            .as_deref()
            .map(|question| (question, self.last_answer.as_deref()))
    }
}

/// Build the user turn sent to the model for a listener question.
pub fn compose_prompt(
    question: &str,
    lecture_context: &str,
    current_passage: Option<&str>,
    previous: Option<(&str, Option<&str>)>,
) -> String {
    let mut prompt = String::from(
        "The listener paused the lecture to ask a question. Answer briefly and \
         conversationally, using the lecture material below. Do not continue the \
         lecture narration.\n",
    );

    if !lecture_context.trim().is_empty() {
        prompt.push_str("\nRecent lecture material:\n");
        prompt.push_str(lecture_context.trim());
        prompt.push('\n');
    }

    if let Some(passage) = current_passage.filter(|p| !p.trim().is_empty()) {
        prompt.push_str("\nPassage being narrated when the listener interrupted:\n");
        prompt.push_str(passage.trim());
        prompt.push('\n');
    }

    if let Some((earlier_question, earlier_answer)) = previous {
        prompt.push_str("\nThis is a follow-up to the previous exchange.\n");
        prompt.push_str(&format!("Earlier question: {earlier_question}\n"));
        match earlier_answer.filter(|a| !a.trim().is_empty()) {
            Some(answer) => prompt.push_str(&format!("Your earlier answer: {}\n", answer.trim())),
            None => prompt.push_str("Your earlier answer was cut off before it started.\n"),
        }
    }

    prompt.push_str(&format!("\nQuestion: {}", question.trim()));
    prompt
}
