use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::CurriculumError;

// =============================================================================
// Monitor Log Layout
// =============================================================================
//
// One row per episode, whitespace separated, after HEADER_LINES lines of
// header. Only the columns below are relied upon by the dataset builder;
// their positions must not move.

pub mod col {
    pub const EPISODE: usize = 0;
    pub const STEPS: usize = 1;
    pub const RETURN: usize = 2;
    pub const DURATION: usize = 3;
    pub const DAMAGE: usize = 4;
    pub const DISTANCE: usize = 5;
    pub const TD_ERROR: usize = 11;
    pub const COMPLEXITY: usize = 12;
    pub const COUNT: usize = 13;
}

pub const HEADER_LINES: usize = 3;

/// The per-episode fields read back from a monitor log.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MonitorRow {
    pub duration: f64,
    pub td_error: f64,
    pub complexity: f64,
    pub damage: f64,
    pub distance: f64,
}

/// Reads every episode row of a monitor log.
///
/// Rows with too few columns or unparsable numbers make the whole file
/// corrupt; callers skip it.
pub fn read_log<P: AsRef<Path>>(path: P) -> Result<Vec<MonitorRow>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open monitor log {}", path.display()))?;
    let reader = BufReader::new(file);
    let corrupt = |reason: String| CurriculumError::DataCorruption {
        path: path.to_path_buf(),
        reason,
    };

    let mut rows = Vec::new();
    for (lineno, line) in reader.lines().enumerate().skip(HEADER_LINES) {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|f| !f.is_empty())
            .collect();
        if fields.len() < col::COUNT {
            return Err(corrupt(format!(
                "line {} has {} columns, expected {}",
                lineno + 1,
                fields.len(),
                col::COUNT
            ))
            .into());
        }
        let parse = |idx: usize| -> Result<f64, CurriculumError> {
            fields[idx].parse::<f64>().map_err(|e| {
                corrupt(format!("line {} column {idx}: {e}", lineno + 1))
            })
        };
        rows.push(MonitorRow {
            duration: parse(col::DURATION)?,
            td_error: parse(col::TD_ERROR)?,
            complexity: parse(col::COMPLEXITY)?,
            damage: parse(col::DAMAGE)?,
            distance: parse(col::DISTANCE)?,
        });
    }

    if rows.is_empty() {
        return Err(corrupt("no episode rows".into()).into());
    }
    Ok(rows)
}

// =============================================================================
// Writer
// =============================================================================

/// Appends episode rows in the monitor layout.
pub struct MonitorWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    episodes: u64,
}

impl MonitorWriter {
    pub fn create<P: AsRef<Path>>(path: P, title: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)
            .with_context(|| format!("Failed to create monitor log {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "# {title}")?;
        writeln!(
            writer,
            "# columns: episode steps return duration damage distance - - - - - td_error complexity"
        )?;
        writeln!(writer, "#")?;
        Ok(Self {
            writer,
            path,
            episodes: 0,
        })
    }

    pub fn record(&mut self, steps: u64, episode_return: f64, row: &MonitorRow) -> Result<()> {
        let mut fields = [0.0f64; col::COUNT];
        fields[col::EPISODE] = self.episodes as f64;
        fields[col::STEPS] = steps as f64;
        fields[col::RETURN] = episode_return;
        fields[col::DURATION] = row.duration;
        fields[col::DAMAGE] = row.damage;
        fields[col::DISTANCE] = row.distance;
        fields[col::TD_ERROR] = row.td_error;
        fields[col::COMPLEXITY] = row.complexity;
        let line: Vec<String> = fields.iter().map(|v| format!("{v}")).collect();
        writeln!(self.writer, "{}", line.join(" "))?;
        self.episodes += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer.flush()?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    #[test]
    fn reads_fixed_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.monitor.csv");
        std::fs::write(
            &path,
            "# a\n# b\n# c\n0 10 5.0 1.5 2.0 11.0 0 0 0 0 0 0.25 3.0\n1 20 6.0 1.6 2.5 12.0 0 0 0 0 0 0.5 3.5\n",
        )
        .unwrap();
        let rows = read_log(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            MonitorRow {
                duration: 1.5,
                td_error: 0.25,
                complexity: 3.0,
                damage: 2.0,
                distance: 11.0,
            }
        );
        assert_eq!(rows[1].damage, 2.5);
    }

    #[test]
    fn short_rows_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.monitor.csv");
        std::fs::write(&path, "#\n#\n#\n1 2 3 4 5\n").unwrap();
        let err = read_log(&path).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(CurriculumError::DataCorruption { .. })
        ));
    }

    #[test]
    fn writer_output_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = MonitorWriter::create(dir.path().join("w.monitor.csv"), "test").unwrap();
        let row = MonitorRow {
            duration: 0.5,
            td_error: 0.1,
            complexity: 2.0,
            damage: 7.0,
            distance: 3.0,
        };
        w.record(100, 12.0, &row).unwrap();
        let path = w.finish().unwrap();
        assert_eq!(read_log(path).unwrap(), vec![row]);
    }
}
