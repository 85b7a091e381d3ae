//! Transition tables for runs, steps, and agents.
//!
//! Every persisted status write goes through one of these checks. A status
//! may always move to itself; any other move must be listed as an edge.

use crate::model::{AgentStatus, RunStatus, StepStatus};

fn run_edges(from: RunStatus) -> &'static [RunStatus] {
    use RunStatus::*;
    match from {
        Created => &[Planning],
        Planning => &[Running, Paused, Failed, Stopping],
        Running => &[AwaitingGuidance, Paused, Failed, Completed, Stopping],
        AwaitingGuidance => &[Running, Failed, Stopping],
        Paused => &[Running, Stopping],
        Failed => &[Running, Stopping],
        Stopping => &[Stopped],
        Stopped => &[Running],
        Completed => &[Closing, Running],
        Closing => &[Closed, Failed],
        Closed => &[],
    }
}

fn step_edges(from: StepStatus) -> &'static [StepStatus] {
    use StepStatus::*;
    match from {
        Pending => &[Running, Skipped],
        Running => &[Done, Failed],
        Failed => &[Running, Skipped],
        Done => &[],
        Skipped => &[],
    }
}

fn agent_edges(from: AgentStatus) -> &'static [AgentStatus] {
    use AgentStatus::*;
    match from {
        // Stop and Cleanup mark live and never-started agents stopped directly.
        Pending => &[Running, Stopped],
        Running => &[Idle, Stalled, Dead, Stopping, Stopped, Failed],
        Idle => &[Running, Stalled, Dead, Stopping, Stopped, Failed],
        Stalled => &[Running, Idle, Dead, Stopping, Stopped, Failed],
        Stopping => &[Stopped],
        // Restart relaunches stopped, dead, or failed sessions.
        Stopped => &[Running],
        Dead => &[Running, Stopped],
        Failed => &[Running, Stopped],
    }
}

pub fn can_transition_run(from: RunStatus, to: RunStatus) -> bool {
    from == to || run_edges(from).contains(&to)
}

pub fn can_transition_step(from: StepStatus, to: StepStatus) -> bool {
    from == to || step_edges(from).contains(&to)
}

pub fn can_transition_agent(from: AgentStatus, to: AgentStatus) -> bool {
    from == to || agent_edges(from).contains(&to)
}
