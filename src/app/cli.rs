#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Job,
    Setup,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "job" => CliVerb::Job,
        "setup" => CliVerb::Setup,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Create,
    Run,
    Log,
    Steps,
    List,
    Unknown,
}

pub fn parse_job_action(input: &str) -> JobAction {
    match input {
        "create" => JobAction::Create,
        "run" => JobAction::Run,
        "log" => JobAction::Log,
        "steps" => JobAction::Steps,
        "list" => JobAction::List,
        _ => JobAction::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Commands:".to_string(),
        "  setup                                Initialize the state root and config skeleton"
            .to_string(),
        "  job create [flags]                   Queue a new job on the control plane".to_string(),
        "    --flow <name> | --task <name> | --plan-version <id>   (exactly one)".to_string(),
        "    --env-user <id> | --scratch <profile>                 (exactly one)".to_string(),
        "  job run <job_id> [--retry-scratch] [--verbose]".to_string(),
        "                                       Claim and execute a queued job".to_string(),
        "  job log <job_id>                     Tail the job's live log channel".to_string(),
        "  job steps <job_id>                   Print the flattened step table".to_string(),
        "  job list [--status a,b]              List jobs, optionally filtered by status"
            .to_string(),
        "  help                                 Show this help".to_string(),
    ]
}

pub(crate) fn help_text() -> String {
    cli_help_lines().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_parse() {
        assert_eq!(parse_cli_verb("job"), CliVerb::Job);
        assert_eq!(parse_cli_verb("setup"), CliVerb::Setup);
        assert_eq!(parse_cli_verb("--help"), CliVerb::Help);
        assert_eq!(parse_cli_verb("jobs"), CliVerb::Unknown);
    }

    #[test]
    fn job_actions_parse() {
        assert_eq!(parse_job_action("run"), JobAction::Run);
        assert_eq!(parse_job_action("list"), JobAction::List);
        assert_eq!(parse_job_action("delete"), JobAction::Unknown);
    }
}
