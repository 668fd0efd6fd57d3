//! Operator command catalog expressed as a small grammar tree.
//!
//! The parser walks the same const tables that `help` renders, so keywords
//! and defaults cannot drift apart.

use crate::phase::PHASE_COUNT;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandTag {
    Calibrate,
    Reset,
    Crc,
    Stats,
    Fault,
    Status,
    Help,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubcommandTag {
    FaultReselect,
    FaultNoLock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChoiceTag {
    ModeSdr50,
    ModeSdr104,
    FaultTx,
    FaultRx,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueSpec {
    None,
    /// `key=<n>` with `n` at most `max`.
    IntegerAssignment {
        max: u8,
        suggestions: &'static [&'static str],
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelpTopics {
    None,
    Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub tag: CommandTag,
    pub grammar: &'static Node,
    pub help: HelpTopics,
    /// Usage line shown by `help`.
    pub usage: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Node {
    End,
    OptionalChoice {
        choices: &'static [ChoiceBranch],
        default: Option<DefaultChoice>,
    },
    Subcommands(&'static [SubcommandBranch]),
    Topic {
        topics: HelpTopics,
        next: &'static Node,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChoiceBranch {
    pub keyword: &'static str,
    pub tag: ChoiceTag,
    pub value: ValueSpec,
    pub next: &'static Node,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultChoice {
    pub tag: ChoiceTag,
    pub next: &'static Node,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubcommandBranch {
    pub name: &'static str,
    pub tag: SubcommandTag,
    pub grammar: &'static Node,
}

const END: Node = Node::End;

#[allow(clippy::cast_possible_truncation)]
const MAX_TAP: u8 = (PHASE_COUNT - 1) as u8;

const MODE_CHOICES: [ChoiceBranch; 2] = [
    ChoiceBranch {
        keyword: "sdr50",
        tag: ChoiceTag::ModeSdr50,
        value: ValueSpec::None,
        next: &END,
    },
    ChoiceBranch {
        keyword: "sdr104",
        tag: ChoiceTag::ModeSdr104,
        value: ValueSpec::None,
        next: &END,
    },
];

const MODE_GRAMMAR: Node = Node::OptionalChoice {
    choices: &MODE_CHOICES,
    default: Some(DefaultChoice {
        tag: ChoiceTag::ModeSdr104,
        next: &END,
    }),
};

const TAP_SUGGESTIONS: [&str; 3] = ["0", "5", "10"];

const RESELECT_RX_CHOICES: [ChoiceBranch; 1] = [ChoiceBranch {
    keyword: "rx",
    tag: ChoiceTag::FaultRx,
    value: ValueSpec::IntegerAssignment {
        max: MAX_TAP,
        suggestions: &TAP_SUGGESTIONS,
    },
    next: &END,
}];

const RESELECT_RX: Node = Node::OptionalChoice {
    choices: &RESELECT_RX_CHOICES,
    default: None,
};

const RESELECT_TX_CHOICES: [ChoiceBranch; 1] = [ChoiceBranch {
    keyword: "tx",
    tag: ChoiceTag::FaultTx,
    value: ValueSpec::IntegerAssignment {
        max: MAX_TAP,
        suggestions: &TAP_SUGGESTIONS,
    },
    next: &RESELECT_RX,
}];

const RESELECT_GRAMMAR: Node = Node::OptionalChoice {
    choices: &RESELECT_TX_CHOICES,
    default: None,
};

const FAULT_SUBCOMMANDS: [SubcommandBranch; 2] = [
    SubcommandBranch {
        name: "reselect",
        tag: SubcommandTag::FaultReselect,
        grammar: &RESELECT_GRAMMAR,
    },
    SubcommandBranch {
        name: "nolock",
        tag: SubcommandTag::FaultNoLock,
        grammar: &END,
    },
];

const FAULT_GRAMMAR: Node = Node::Subcommands(&FAULT_SUBCOMMANDS);

const HELP_GRAMMAR: Node = Node::Topic {
    topics: HelpTopics::Commands,
    next: &END,
};

const COMMANDS: [CommandSpec; 7] = [
    CommandSpec {
        name: "calibrate",
        tag: CommandTag::Calibrate,
        grammar: &MODE_GRAMMAR,
        help: HelpTopics::None,
        usage: "calibrate [sdr50|sdr104]",
    },
    CommandSpec {
        name: "reset",
        tag: CommandTag::Reset,
        grammar: &MODE_GRAMMAR,
        help: HelpTopics::None,
        usage: "reset [sdr50|sdr104]",
    },
    CommandSpec {
        name: "crc",
        tag: CommandTag::Crc,
        grammar: &MODE_GRAMMAR,
        help: HelpTopics::None,
        usage: "crc [sdr50|sdr104]",
    },
    CommandSpec {
        name: "stats",
        tag: CommandTag::Stats,
        grammar: &MODE_GRAMMAR,
        help: HelpTopics::None,
        usage: "stats [sdr50|sdr104]",
    },
    CommandSpec {
        name: "fault",
        tag: CommandTag::Fault,
        grammar: &FAULT_GRAMMAR,
        help: HelpTopics::None,
        usage: "fault reselect tx=<n> rx=<n> | fault nolock",
    },
    CommandSpec {
        name: "status",
        tag: CommandTag::Status,
        grammar: &END,
        help: HelpTopics::None,
        usage: "status",
    },
    CommandSpec {
        name: "help",
        tag: CommandTag::Help,
        grammar: &HELP_GRAMMAR,
        help: HelpTopics::Commands,
        usage: "help [command]",
    },
];

/// Returns the full command catalog.
#[must_use]
pub const fn commands() -> &'static [CommandSpec] {
    &COMMANDS
}

/// Looks up a command by its tag.
#[must_use]
pub fn command(tag: CommandTag) -> &'static CommandSpec {
    match tag {
        CommandTag::Calibrate => &COMMANDS[0],
        CommandTag::Reset => &COMMANDS[1],
        CommandTag::Crc => &COMMANDS[2],
        CommandTag::Stats => &COMMANDS[3],
        CommandTag::Fault => &COMMANDS[4],
        CommandTag::Status => &COMMANDS[5],
        CommandTag::Help => &COMMANDS[6],
    }
}

/// Finds a command by name (case insensitive).
#[must_use]
pub fn find(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|command| command.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_index_their_own_entries() {
        for spec in commands() {
            assert_eq!(command(spec.tag).name, spec.name);
        }
    }

    #[test]
    fn lookup_ignores_case() {
        assert_eq!(find("CALIBRATE").map(|spec| spec.tag), Some(CommandTag::Calibrate));
        assert!(find("eject").is_none());
    }
}
