use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    Pass,
    /// Command completed with a status other than GOOD
    CheckCondition(u8),
    Failed(ProbeFailure),
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ProbeFailure {
    /// Bus-level failure (selection timeout, phase error, stall)
    Protocol(String),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ProbeStep {
    pub name: String,
    pub result: ProbeResult,
    /// Data In bytes as hex
    pub data: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ProbeCapacity {
    pub last_lba: u32,
    pub block_len: u32,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ProbeReport {
    pub image: String,
    pub bus: String,
    pub id: usize,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub capacity: Option<ProbeCapacity>,
    pub steps: Vec<ProbeStep>,
}

impl ProbeReport {
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|s| s.result == ProbeResult::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_json() {
        let report = ProbeReport {
            id: 3,
            steps: vec![ProbeStep {
                name: "INQUIRY".to_string(),
                result: ProbeResult::Failed(ProbeFailure::Protocol("timeout".to_string())),
                data: None,
            }],
            ..Default::default()
        };
        let json = serde_json::to_string(&report).unwrap();
        let back: ProbeReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 3);
        assert_eq!(back.steps[0].result, report.steps[0].result);
    }

    #[test]
    fn passed() {
        let mut report = ProbeReport::default();
        assert!(report.passed());
        report.steps.push(ProbeStep {
            name: "TEST UNIT READY".to_string(),
            result: ProbeResult::CheckCondition(2),
            data: None,
        });
        assert!(!report.passed());
    }
}
