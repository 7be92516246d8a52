use exit_result::ExitResult;

pub mod dump_command;
pub mod exit_result;
pub mod rdtrace_options;
pub mod symbols_command;

pub trait TraceCommand {
    fn run(&mut self) -> ExitResult<()>;
}
