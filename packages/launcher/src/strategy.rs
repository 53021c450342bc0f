/// Where the launch request came from. The GUI shell passes `Gui`; the
/// command line passes `Cli`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    Gui,
    Cli,
}

/// How we plan to find the app's entry point and give it control. Chosen
/// once per launch and never re-evaluated mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Re-invoke the host binary as a brand-new process that boots straight
    /// into the app. Used from the GUI for apps that don't cooperate with
    /// in-process hosting.
    RestartAndRun,
    /// The app knows about us, so run it directly in-process against the
    /// host gateway.
    HostedInline,
    /// Call straight into the entry point in this process and wait for it.
    /// Used when we're run from the CLI.
    InvokeDirectly,
}

/// What the artifact declared about itself, gathered before the strategy
/// decision so the decision itself stays a pure function.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// The component exports the host's app world or opted in via the
    /// `inline` manifest feature.
    pub inline_capable: bool,
}

pub fn select_load_strategy(context: ExecutionContext, caps: Capabilities) -> LoadStrategy {
    match context {
        ExecutionContext::Cli => LoadStrategy::InvokeDirectly,
        ExecutionContext::Gui if caps.inline_capable => LoadStrategy::HostedInline,
        // A new process keeps whatever runtime state the app drags in from
        // interfering with the shell, and vice versa.
        ExecutionContext::Gui => LoadStrategy::RestartAndRun,
    }
}
