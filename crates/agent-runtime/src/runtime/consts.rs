/// Upper bound on model stream invocations within one user turn.
pub const MAX_TURNS: u32 = 100;

/// Successful completion of this tool triggers the memory-refresh signal.
pub const SAVE_MEMORY_TOOL: &str = "save_memory";

/// Tools whose pre-approval state is snapshotted so the turn and filesystem
/// can be rewound by a restore command.
pub const REPLACE_TOOL: &str = "replace";
pub const WRITE_FILE_TOOL: &str = "write_file";

/// Info line appended when the user cancels a turn.
pub const USER_CANCELLED_INFO: &str = "User cancelled the request.";

/// Continuation query synthesized when the next-speaker check says the model
/// should keep going.
pub const CONTINUE_PROMPT: &str = "Please continue.";

/// Reason recorded when a confirmation is declined.
pub const CONFIRMATION_DECLINED_REASON: &str = "User did not allow tool call";

/// Sentinel prefix routing input to the shell processor while shell mode is
/// active.
pub const SHELL_MODE_SENTINEL: char = '!';

pub fn is_restorable_tool(name: &str) -> bool {
    name == REPLACE_TOOL || name == WRITE_FILE_TOOL
}
