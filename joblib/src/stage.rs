//! The fixed analysis pipeline: QC, alignment, alignment post-processing, quantification.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::tool::Tool;
use crate::types::Args;
use crate::workspace::Workspace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Qc,
    Align,
    Postprocess,
    Quantify,
}

pub type Artifacts = BTreeMap<Stage, Vec<PathBuf>>;

/// Everything needed to run one stage: which tool, its arguments, what it reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: Tool,
    pub args: Args,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Qc, Stage::Align, Stage::Postprocess, Stage::Quantify];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Qc => "qc",
            Stage::Align => "align",
            Stage::Postprocess => "postprocess",
            Stage::Quantify => "quantify",
        }
    }

    pub fn tool(self) -> Tool {
        match self {
            Stage::Qc => Tool::Fastqc,
            Stage::Align => Tool::Minimap2,
            Stage::Postprocess => Tool::Samtools,
            Stage::Quantify => Tool::Crispresso,
        }
    }

    pub fn first() -> Stage {
        Stage::Qc
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Qc => Some(Stage::Align),
            Stage::Align => Some(Stage::Postprocess),
            Stage::Postprocess => Some(Stage::Quantify),
            Stage::Quantify => None,
        }
    }

    /// Build the invocation for this stage.
    ///
    /// `artifacts` holds the outputs of the stages that already succeeded in this attempt; the
    /// previous stage's outputs are always part of the declared inputs.
    pub fn plan(self, job: &Job, workspace: &Workspace, artifacts: &Artifacts) -> Invocation {
        let params = &job.params;
        let threads = params.threads.max(1).to_string();
        let reads = job.inputs.reads();
        let extra = job.extra_args.get(&self.tool()).cloned().unwrap_or_default();
        let previous = self
            .previous()
            .and_then(|stage| artifacts.get(&stage))
            .cloned()
            .unwrap_or_default();
        let out_dir = workspace.stage_dir(self);

        let (args, inputs, outputs) = match self {
            Stage::Qc => {
                let mut args = vec!["-o".into(), path_arg(&out_dir), "-t".into(), threads];
                args.extend(extra);
                args.extend(reads.iter().map(|read| path_arg(read)));
                (args, reads.clone(), vec![out_dir])
            }
            Stage::Align => {
                let sam = out_dir.join("aligned.sam");
                let mut args = vec!["-ax".into(), "sr".into(), "-t".into(), threads];
                args.extend(extra);
                args.extend(["-o".into(), path_arg(&sam)]);
                args.push(path_arg(&job.inputs.amplicon));
                args.extend(reads.iter().map(|read| path_arg(read)));
                let mut inputs = previous;
                inputs.push(job.inputs.amplicon.clone());
                inputs.extend(reads);
                (args, inputs, vec![sam])
            }
            Stage::Postprocess => {
                let bam = out_dir.join("aligned.sorted.bam");
                let mut args = vec!["sort".into(), "-@".into(), threads];
                args.extend(extra);
                args.extend(["-o".into(), path_arg(&bam)]);
                args.extend(previous.iter().map(|sam| path_arg(sam)));
                (args, previous, vec![bam])
            }
            Stage::Quantify => {
                let report = out_dir.join(format!("CRISPResso_on_{}", job.name));
                let mut args = vec!["-r1".into(), path_arg(&job.inputs.r1)];
                if let Some(r2) = &job.inputs.r2 {
                    args.extend(["-r2".into(), path_arg(r2)]);
                }
                args.extend([
                    "-a".into(),
                    params.amplicon.clone(),
                    "-g".into(),
                    params.guide.clone(),
                ]);
                if let Some(coding_seq) = &params.coding_seq {
                    args.extend(["--coding_seq".into(), coding_seq.clone()]);
                }
                args.extend([
                    "--name".into(),
                    job.name.clone(),
                    "-o".into(),
                    path_arg(&out_dir),
                    "--n_processes".into(),
                    threads,
                    "--default_min_aln_score".into(),
                    params.min_aln_score.to_string(),
                    "--plot_window_size".into(),
                    params.plot_window_size.to_string(),
                ]);
                args.extend(extra);
                let mut inputs = previous;
                inputs.extend(reads);
                (args, inputs, vec![report])
            }
        };

        Invocation {
            tool: self.tool(),
            args,
            inputs,
            outputs,
        }
    }

    fn previous(self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .take_while(|stage| *stage != self)
            .last()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn path_arg(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}
