mod compare_floats;
pub mod core;
pub mod corpus;
pub mod errors;
pub mod input;
pub mod output;
pub mod reporting;
mod simulation_time;
pub mod snapshot;

pub use crate::errors::DhwError;
pub use crate::reporting::RunResults;
pub use crate::simulation_time::{SimulationTime, SimulationTimeIteration};
use crate::corpus::Corpus;
use crate::input::read_input;
use crate::output::Output;
use crate::snapshot::StateSnapshot;
use csv::WriterBuilder;
use std::io::{Read, Write};
use tracing::info;

/// Location key of the per-timestep results.
pub const RESULTS_KEY: &str = "results";
/// Location key of the whole-run totals and averages.
pub const SUMMARY_KEY: &str = "results_summary";

pub fn run_project(input: impl Read, output: impl Output) -> Result<RunResults, DhwError> {
    let (results, _) = run_project_from_state(input, output, None)?;
    Ok(results)
}

/// Run a project, optionally resuming tank states from an earlier snapshot, and return the
/// results together with the state at the end of the run.
pub fn run_project_from_state(
    input: impl Read,
    output: impl Output,
    initial_state: Option<&StateSnapshot>,
) -> Result<(RunResults, StateSnapshot), DhwError> {
    let input = read_input(input)?;
    let mut corpus = Corpus::from_inputs(&input)?;
    if let Some(state) = initial_state {
        corpus.restore(state)?;
        info!("Resumed {} water heater state(s)", state.tanks.len());
    }

    let results = corpus.run()?;

    if !output.is_noop() {
        write_results_file(output.writer_for_location_key(RESULTS_KEY)?, &results)?;
        write_summary_file(output.writer_for_location_key(SUMMARY_KEY)?, &results)?;
    }

    Ok((results, corpus.snapshot()))
}

fn write_results_file(writer: impl Write, results: &RunResults) -> anyhow::Result<()> {
    info!("writing out results for {} timesteps", results.timesteps.len());
    let mut writer = WriterBuilder::new().flexible(true).from_writer(writer);

    let mut headings = vec!["Timestep"];
    let mut units_row = vec!["[count]"];
    for column in &results.columns {
        headings.push(&column.heading);
        units_row.push(column.unit);
    }
    writer.write_record(&headings)?;
    writer.write_record(&units_row)?;

    for t_idx in 0..results.timesteps.len() {
        let row = std::iter::once(t_idx.to_string()).chain(
            results
                .columns
                .iter()
                .map(|column| column.values[t_idx].to_string()),
        );
        writer.write_record(row)?;
    }

    writer.flush()?;

    Ok(())
}

fn write_summary_file(writer: impl Write, results: &RunResults) -> anyhow::Result<()> {
    let mut writer = WriterBuilder::new().flexible(true).from_writer(writer);

    writer.write_record(["Variable", "Unit", "Run value"])?;
    for column in &results.columns {
        writer.write_record([
            column.heading.as_str(),
            column.unit,
            column.aggregate().to_string().as_str(),
        ])?;
    }

    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::tests::draw_circuit_input;
    use crate::output::SinkOutput;
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    #[derive(Clone, Debug, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Keeps everything written, by location key.
    #[derive(Debug, Default)]
    struct MemoryOutput {
        files: RefCell<IndexMap<String, SharedBuffer>>,
    }

    impl MemoryOutput {
        fn contents(&self, location_key: &str) -> String {
            let files = self.files.borrow();
            let buffer = files[location_key].0.borrow();
            String::from_utf8(buffer.clone()).unwrap()
        }
    }

    impl Output for &MemoryOutput {
        fn writer_for_location_key(&self, location_key: &str) -> anyhow::Result<impl Write> {
            let buffer = SharedBuffer::default();
            self.files
                .borrow_mut()
                .insert(location_key.to_string(), buffer.clone());
            Ok(buffer)
        }
    }

    fn input_bytes() -> Vec<u8> {
        draw_circuit_input().to_string().into_bytes()
    }

    #[rstest]
    fn should_write_heading_and_unit_rows_then_one_row_per_timestep() {
        let output = MemoryOutput::default();
        let results = run_project(input_bytes().as_slice(), &output).unwrap();

        let contents = output.contents(RESULTS_KEY);
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2 + results.timesteps.len());
        assert!(lines[0].starts_with("Timestep,Cylinder "));
        assert!(lines[1].starts_with("[count],"));
        assert!(lines[2].starts_with("0,"));
        assert_eq!(
            lines[0].split(',').count(),
            1 + results.columns.len()
        );
    }

    #[rstest]
    fn should_write_one_summary_row_per_column() {
        let output = MemoryOutput::default();
        let results = run_project(input_bytes().as_slice(), &output).unwrap();

        let contents = output.contents(SUMMARY_KEY);
        assert_eq!(contents.lines().count(), 1 + results.columns.len());
        assert_eq!(contents.lines().next(), Some("Variable,Unit,Run value"));
    }

    #[rstest]
    fn should_report_invalid_input_without_writing() {
        let output = MemoryOutput::default();
        let result = run_project("{\"simulation_time\": 3}".as_bytes(), &output);

        assert!(matches!(result, Err(DhwError::UnreadableInput(_))));
        assert!(output.files.borrow().is_empty());
    }

    #[rstest]
    fn should_resume_from_final_state_of_an_earlier_run() {
        let (_, state) = run_project_from_state(input_bytes().as_slice(), SinkOutput, None).unwrap();
        assert!(state.setup_complete);
        assert_eq!(state.tanks[0].cumulative.timesteps, 96);

        let (_, resumed) =
            run_project_from_state(input_bytes().as_slice(), SinkOutput, Some(&state)).unwrap();
        assert_eq!(resumed.tanks[0].cumulative.timesteps, 192);
    }
}
