use shepherd_core::{InboxMessage, PolicyConfig, Task};
use shepherd_security::{truncate_chars, PromptSanitizer};
use std::fmt::Write as _;

const TRUNCATION_MARK: usize = "\n[truncated]".len();

/// How the agent signals that it finished the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Print a summary to stdout and exit (bridge mode).
    Exit,
    /// Run this shell command when done (interactive mode).
    DoneCommand(String),
}

/// Everything that goes into one worker prompt.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    /// Worker the prompt is for.
    pub worker: &'a str,
    /// Team the worker belongs to.
    pub team: &'a str,
    /// The claimed task.
    pub task: &'a Task,
    /// Per-worker extra instructions.
    pub overlay: Option<&'a str>,
    /// Lead messages queued since the last prompt.
    pub inbox: &'a [InboxMessage],
    /// How the agent should signal that it is done.
    pub completion: Completion,
}

/// Composes the prompt an agent receives.
///
/// Free text from tasks, overlays and inbox messages is sanitized before it is
/// placed between structural tags, and the whole prompt stays within
/// `max_chars`: the description is shortened first, then inbox messages are
/// dropped oldest-first.
#[derive(Debug, Clone)]
pub struct PromptRenderer {
    sanitizer: PromptSanitizer,
    max_chars: usize,
}

impl PromptRenderer {
    /// Renderer capping each field at `max_field_chars` and the prompt at `max_chars`.
    pub fn new(max_field_chars: usize, max_chars: usize) -> Self {
        Self {
            sanitizer: PromptSanitizer::new(max_field_chars),
            max_chars,
        }
    }

    /// Renderer with the prompt limits from `policy`.
    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self::new(policy.prompt_max_field_chars, policy.prompt_max_chars)
    }

    /// Upper bound on a rendered prompt.
    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Render `ctx` within the size limit.
    pub fn render(&self, ctx: &PromptContext<'_>) -> String {
        let header = format!(
            "You are {}, a worker on team {}. Complete the task below.\n\n",
            self.sanitizer.sanitize(ctx.worker),
            self.sanitizer.sanitize(ctx.team),
        );
        let instructions = ctx
            .overlay
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(|o| format!("<instructions>\n{}\n</instructions>\n\n", self.sanitizer.sanitize(o)))
            .unwrap_or_default();
        let subject = self.sanitizer.sanitize(&ctx.task.subject);
        let task_open = format!(
            "<task>\n<task_id>{}</task_id>\n<task_subject>{subject}</task_subject>\n<task_description>\n",
            ctx.task.id
        );
        let task_close = "\n</task_description>\n</task>\n\n";
        let completion = completion_block(&ctx.completion);

        let fixed = [header.as_str(), &instructions, &task_open, task_close, &completion]
            .iter()
            .map(|s| s.chars().count())
            .sum::<usize>();
        let mut budget = self.max_chars.saturating_sub(fixed);

        let mut description = self.sanitizer.sanitize(&ctx.task.description);
        if description.chars().count() > budget {
            description = truncate_chars(&description, budget.saturating_sub(TRUNCATION_MARK));
        }
        budget = budget.saturating_sub(description.chars().count());

        let inbox = self.render_inbox(ctx.inbox, budget);

        let mut out = String::with_capacity(fixed + description.len() + inbox.len());
        out.push_str(&header);
        out.push_str(&instructions);
        out.push_str(&task_open);
        out.push_str(&description);
        out.push_str(task_close);
        out.push_str(&inbox);
        out.push_str(&completion);
        out
    }

    /// Newest messages win when not all of them fit.
    fn render_inbox(&self, inbox: &[InboxMessage], budget: usize) -> String {
        const OPEN: &str = "<inbox>\n";
        const CLOSE: &str = "</inbox>\n\n";
        let frame = OPEN.len() + CLOSE.len();
        if inbox.is_empty() || budget <= frame {
            return String::new();
        }
        let mut remaining = budget - frame;
        let mut kept = Vec::new();
        for message in inbox.iter().rev() {
            let entry = format!(
                "<inbox_message at=\"{}\">\n{}\n</inbox_message>\n",
                message.timestamp.to_rfc3339(),
                self.sanitizer.sanitize(&message.content)
            );
            let len = entry.chars().count();
            if len > remaining {
                break;
            }
            remaining -= len;
            kept.push(entry);
        }
        if kept.is_empty() {
            return String::new();
        }
        let mut out = String::from(OPEN);
        for entry in kept.iter().rev() {
            out.push_str(entry);
        }
        out.push_str(CLOSE);
        out
    }
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::from_policy(&PolicyConfig::default())
    }
}

fn completion_block(completion: &Completion) -> String {
    let mut out = String::from("<completion>\n");
    match completion {
        Completion::Exit => {
            out.push_str(
                "Work in the current directory. When you are done, print a short summary \
                 of what you changed to standard output and exit. Exit with a non-zero \
                 status if you could not complete the task.\n",
            );
        }
        Completion::DoneCommand(command) => {
            let _ = writeln!(
                out,
                "Work in the current directory. When you are done, run exactly:\n{command} --summary \"<one line summary>\"\n\
                 If you cannot complete the task, run it with --failed \"<reason>\" instead."
            );
        }
    }
    out.push_str("</completion>\n");
    out
}
