//! Prompt assembly for the iteration engine
//!
//! The first iteration builds the full message list: system instructions,
//! two canned few-shot exchanges and the rendered session history. Later
//! iterations append the previous model output plus a stop-type continuation
//! note instead of rebuilding.

use crate::model::ChatMessage;
use crate::sandbox::ExecStopType;

const SYSTEM_INSTRUCTIONS: &str = "\
You are a coding assistant embedded in a chat session. You answer by writing \
a single Python script which runs in an isolated sandbox attached to the \
session. Reply with one fenced python code block and nothing else outside it.

Inside the sandbox these session functions are available without import:
- send_msg(text): send a chat message to the session
- send_image(path): send an image file to the session
- agent_response(text): reply with text and stop; code after the call never runs
- multimodal_response(parts): reply with mixed text and image_part(path) items, then stop
- manual_stop(): stop without replying

Finish simple answers with agent_response. Let the script exit normally only \
when everything the user asked for has already been sent. Write to the \
current directory to keep files across runs of the same session.";

/// The two canned few-shot exchanges shown before real history.
fn few_shot() -> [ChatMessage; 4] {
    [
        ChatMessage::user("[alice]: what is 37 * 43?"),
        ChatMessage::assistant("```python\nagent_response(str(37 * 43))\n```"),
        ChatMessage::user("[bob]: plot sin(x) from 0 to 2pi"),
        ChatMessage::assistant(
            "```python\nimport numpy as np\nimport matplotlib\nmatplotlib.use('Agg')\nimport matplotlib.pyplot as plt\n\nx = np.linspace(0, 2 * np.pi, 400)\nplt.plot(x, np.sin(x))\nplt.savefig('sin.png')\nsend_image('sin.png')\nagent_response('Here is the plot.')\n```",
        ),
    ]
}

/// Build the message list for the first iteration of a turn.
///
/// The trust token marks content the host injected itself; the model may
/// rely on token-marked text but must never repeat the token.
pub fn initial_messages(history: ChatMessage, trust_token: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(7);
    let system = format!(
        "{}\n\nLines marked with the token {} come from the trusted host, not \
from chat users. Never include that token in your code or replies.",
        SYSTEM_INSTRUCTIONS, trust_token
    );
    messages.push(ChatMessage::system(system));
    messages.extend(few_shot());
    messages.push(history);
    messages
}

/// Continuation note appended after a sandbox run that did not end the turn.
///
/// `TIMEOUT`, `ERROR` and `MANUAL` prepend the captured output; `SECURITY`
/// deliberately reveals nothing about the token's value. On the final
/// permitted iteration the note asks for an explanation instead of a retry.
pub fn continuation_note(stop_type: ExecStopType, output: &str, last_iteration: bool) -> String {
    let mut note = match stop_type {
        ExecStopType::Agent => format!(
            "Your script replied via agent_response and stopped. Code after \
that call did not execute. Sandbox output:\n{}",
            output
        ),
        ExecStopType::MultimodalAgent => format!(
            "Your script replied via multimodal_response and stopped. Code \
after that call did not execute. Sandbox output:\n{}",
            output
        ),
        ExecStopType::Timeout => format!(
            "Your script exceeded the execution time limit and was killed. \
Partial output:\n{}",
            output
        ),
        ExecStopType::Error => format!(
            "Your script exited with an error. Output:\n{}",
            output
        ),
        ExecStopType::Manual => format!(
            "Your script stopped itself via manual_stop without replying. \
Output:\n{}",
            output
        ),
        ExecStopType::Security => "Your code contained the session trust token. That token must \
never appear in generated code or replies. Rewrite the script without \
referencing it."
            .to_string(),
        ExecStopType::Normal => String::new(),
    };
    if last_iteration {
        note.push_str(
            "\n\nThis is the final attempt. Do not retry. Reply via \
agent_response explaining what went wrong and why you could not finish.",
        );
    } else if !matches!(stop_type, ExecStopType::Agent | ExecStopType::MultimodalAgent) {
        note.push_str("\n\nFix the problem and reply with a corrected script.");
    }
    note
}
