//! Debugger commands refused unless the caller explicitly opts in.
//!
//! Each rule names a command prefix, why it is refused, and what to do
//! instead. Matching is on whole words after whitespace is collapsed and
//! case is folded, so `Process   KILL` matches `process kill` while
//! `killall-threads` does not match `kill`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenyRule {
    pub prefix: &'static str,
    pub reason: &'static str,
    pub alternative: &'static str,
}

const RULES: &[DenyRule] = &[
    DenyRule {
        prefix: "platform shell",
        reason: "runs arbitrary shell commands on the host",
        alternative: "use the dedicated build, simulator or device commands",
    },
    DenyRule {
        prefix: "shell",
        reason: "runs arbitrary shell commands on the host",
        alternative: "use the dedicated build, simulator or device commands",
    },
    DenyRule {
        prefix: "script",
        reason: "executes arbitrary Python inside the debugger",
        alternative: "use built-in commands such as 'frame variable' or 'expression'",
    },
    DenyRule {
        prefix: "command script import",
        reason: "loads an external Python script into the debugger",
        alternative: "use built-in debugger commands",
    },
    DenyRule {
        prefix: "command source",
        reason: "runs commands from an external file",
        alternative: "send the commands individually",
    },
    DenyRule {
        prefix: "process kill",
        reason: "terminates the debugged app",
        alternative: "detach the session, then stop the app with the simulator commands",
    },
    DenyRule {
        prefix: "kill",
        reason: "terminates the debugged app",
        alternative: "detach the session, then stop the app with the simulator commands",
    },
    DenyRule {
        prefix: "process signal",
        reason: "delivers arbitrary signals to the debugged app",
        alternative: "use 'process interrupt' to pause execution",
    },
    DenyRule {
        prefix: "memory write",
        reason: "writes raw bytes into the app's memory",
        alternative: "use 'expression' to assign to a typed variable",
    },
    DenyRule {
        prefix: "register write",
        reason: "overwrites CPU registers of the app",
        alternative: "inspect registers with 'register read'",
    },
    DenyRule {
        prefix: "process load",
        reason: "loads external code into the app",
        alternative: "rebuild the app with the code linked in",
    },
    DenyRule {
        prefix: "target modules add",
        reason: "loads external code into the debug target",
        alternative: "rebuild the app with the code linked in",
    },
    DenyRule {
        prefix: "settings set target.",
        reason: "changes how the target is launched",
        alternative: "pass launch options through the launch command",
    },
    DenyRule {
        prefix: "target delete",
        reason: "deletes the debug target from the session",
        alternative: "detach the session instead",
    },
];

/// Expression evaluation that loads a shared library into the target.
/// Matched anywhere in the expression rather than as a prefix.
static CODE_LOADING: DenyRule = DenyRule {
    prefix: "dlopen",
    reason: "loads external code into the app through expression evaluation",
    alternative: "rebuild the app with the code linked in",
};

const EXPRESSION_COMMANDS: &[&str] = &["expression", "expr", "e", "p", "po", "print", "call"];

pub fn rules() -> &'static [DenyRule] {
    RULES
}

/// Trim, collapse runs of whitespace to one space, and lowercase.
pub fn normalize(command: &str) -> String {
    command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// The first rule that `command` falls under, if any.
pub fn check(command: &str) -> Option<&'static DenyRule> {
    let normalized = normalize(command);
    if let Some(rule) = RULES.iter().find(|rule| matches_prefix(&normalized, rule.prefix)) {
        return Some(rule);
    }
    let evaluates = normalized
        .split(' ')
        .next()
        .is_some_and(|word| EXPRESSION_COMMANDS.contains(&word));
    (evaluates && normalized.contains(CODE_LOADING.prefix)).then_some(&CODE_LOADING)
}

fn matches_prefix(normalized: &str, prefix: &str) -> bool {
    let Some(rest) = normalized.strip_prefix(prefix) else {
        return false;
    };
    let prefix_ends_word = prefix
        .chars()
        .last()
        .is_some_and(|c| c.is_alphanumeric());
    rest.is_empty() || rest.starts_with(' ') || !prefix_ends_word
}
