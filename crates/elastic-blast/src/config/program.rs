use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlastProgram {
    Blastn,
    Megablast,
    Blastp,
    Blastx,
    Tblastn,
    Tblastx,
    Psiblast,
    Rpsblast,
    Rpstblastn,
}

impl BlastProgram {
    pub const ALL: [BlastProgram; 9] = [
        BlastProgram::Blastn,
        BlastProgram::Megablast,
        BlastProgram::Blastp,
        BlastProgram::Blastx,
        BlastProgram::Tblastn,
        BlastProgram::Tblastx,
        BlastProgram::Psiblast,
        BlastProgram::Rpsblast,
        BlastProgram::Rpstblastn,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BlastProgram::Blastn => "blastn",
            BlastProgram::Megablast => "megablast",
            BlastProgram::Blastp => "blastp",
            BlastProgram::Blastx => "blastx",
            BlastProgram::Tblastn => "tblastn",
            BlastProgram::Tblastx => "tblastx",
            BlastProgram::Psiblast => "psiblast",
            BlastProgram::Rpsblast => "rpsblast",
            BlastProgram::Rpstblastn => "rpstblastn",
        }
    }

    /// Binary executed inside the search container.
    pub fn executable(&self) -> &'static str {
        match self {
            BlastProgram::Megablast => "blastn",
            other => other.name(),
        }
    }

    /// Default number of query residues per batch.
    pub fn default_batch_len(&self) -> u64 {
        match self {
            BlastProgram::Blastn | BlastProgram::Megablast => 5_000_000,
            BlastProgram::Blastp => 10_000,
            BlastProgram::Blastx | BlastProgram::Tblastn => 20_000,
            BlastProgram::Tblastx
            | BlastProgram::Psiblast
            | BlastProgram::Rpsblast
            | BlastProgram::Rpstblastn => 100_000,
        }
    }
}

impl Display for BlastProgram {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BlastProgram {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|program| program.name() == name)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|p| p.name()).collect();
                anyhow::anyhow!("unknown program `{s}`, expected one of {}", known.join(", "))
            })
    }
}
