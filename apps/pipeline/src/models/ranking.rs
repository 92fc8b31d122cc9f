use serde::{Deserialize, Serialize};

/// One resume in a batch-ranking request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeForRanking {
    pub candidate_id: String,
    pub name: String,
    pub content: String,
    pub metadata: ResumeMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeMetadata {
    pub skills: Vec<String>,
    pub experience: String,
    pub applicant_id: String,
}

/// Body of the batch-ranking call: one page of resumes against one job.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRankingRequest {
    pub job_description: String,
    pub requirements: Vec<String>,
    pub skills: Vec<String>,
    pub resumes: Vec<ResumeForRanking>,
}

/// Per-candidate scores as returned by the batch-ranking service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CandidateScore {
    #[serde(rename = "candidateId")]
    pub candidate_id: String,
    #[serde(default)]
    pub name: String,
    pub total_score: f64,
    #[serde(default)]
    pub technical_score: f64,
    #[serde(default)]
    pub experience_score: f64,
    #[serde(default)]
    pub education_score: f64,
    #[serde(default)]
    pub soft_skills_score: f64,
    #[serde(default)]
    pub technical_strengths: Vec<String>,
    #[serde(default)]
    pub technical_gaps: Vec<String>,
    #[serde(default)]
    pub experience_strengths: Vec<String>,
    #[serde(default)]
    pub experience_gaps: Vec<String>,
    #[serde(default)]
    pub education_strengths: Vec<String>,
    #[serde(default)]
    pub education_gaps: Vec<String>,
    #[serde(default)]
    pub analysis: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchRankingResponse {
    pub results: Vec<CandidateScore>,
}

/// Flattened result kept in the job's results cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingResult {
    #[serde(rename = "candidateId")]
    pub candidate_id: String,
    pub total_score: f64,
    pub technical_score: f64,
    pub experience_score: f64,
    pub education_score: f64,
    pub soft_skills_score: f64,
    pub strengths: Vec<String>,
    pub gaps: Vec<String>,
    pub analysis: String,
}

impl From<&CandidateScore> for RankingResult {
    fn from(score: &CandidateScore) -> Self {
        Self {
            candidate_id: score.candidate_id.clone(),
            total_score: score.total_score,
            technical_score: score.technical_score,
            experience_score: score.experience_score,
            education_score: score.education_score,
            soft_skills_score: score.soft_skills_score,
            strengths: score
                .technical_strengths
                .iter()
                .chain(&score.experience_strengths)
                .cloned()
                .collect(),
            gaps: score
                .technical_gaps
                .iter()
                .chain(&score.experience_gaps)
                .cloned()
                .collect(),
            analysis: score.analysis.clone(),
        }
    }
}

/// Cached under `ranking:job:<jobId>:results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingResultsEntry {
    /// Write time, epoch milliseconds.
    pub timestamp: i64,
    pub results: Vec<RankingResult>,
    pub total: u64,
    pub processed: u64,
}

impl RankingResultsEntry {
    /// True while the entry is younger than `max_age_ms` at `now_ms`.
    pub fn is_fresh_at(&self, now_ms: i64, max_age_ms: i64) -> bool {
        now_ms - self.timestamp < max_age_ms
    }
}

/// Sorts results by `total_score`, highest first.
pub fn sort_by_score_desc(results: &mut [RankingResult]) {
    results.sort_by(|a, b| b.total_score.total_cmp(&a.total_score));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAnalysis {
    pub score: f64,
    pub strengths: Vec<String>,
    pub gaps: Vec<String>,
}

/// Structured `aiAnalysis` stored on the applicant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicantAnalysis {
    pub technical_skills: CategoryAnalysis,
    pub experience: CategoryAnalysis,
    pub education: CategoryAnalysis,
}

/// Score update for one applicant derived from a ranking result.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicantScoreUpdate {
    pub candidate_id: String,
    pub job_fit_score: f64,
    pub ai_analysis: ApplicantAnalysis,
}

impl From<&CandidateScore> for ApplicantScoreUpdate {
    fn from(score: &CandidateScore) -> Self {
        Self {
            candidate_id: score.candidate_id.clone(),
            job_fit_score: score.total_score,
            ai_analysis: ApplicantAnalysis {
                technical_skills: CategoryAnalysis {
                    score: score.technical_score,
                    strengths: score.technical_strengths.clone(),
                    gaps: score.technical_gaps.clone(),
                },
                experience: CategoryAnalysis {
                    score: score.experience_score,
                    strengths: score.experience_strengths.clone(),
                    gaps: score.experience_gaps.clone(),
                },
                education: CategoryAnalysis {
                    score: score.education_score,
                    strengths: score.education_strengths.clone(),
                    gaps: score.education_gaps.clone(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn score(candidate: &str, total: f64) -> CandidateScore {
        serde_json::from_value(json!({
            "candidateId": candidate,
            "total_score": total,
            "technical_strengths": ["rust"],
            "technical_gaps": ["kafka"],
            "experience_strengths": ["5 years backend"],
            "experience_gaps": [],
            "education_gaps": ["no degree"]
        }))
        .unwrap()
    }

    #[test]
    fn test_missing_score_fields_default() {
        let parsed = score("c1", 71.5);
        assert_eq!(parsed.total_score, 71.5);
        assert_eq!(parsed.soft_skills_score, 0.0);
        assert!(parsed.education_strengths.is_empty());
    }

    #[test]
    fn test_result_merges_technical_and_experience_lists() {
        let result = RankingResult::from(&score("c1", 80.0));
        assert_eq!(result.strengths, vec!["rust", "5 years backend"]);
        assert_eq!(result.gaps, vec!["kafka"]);
    }

    #[test]
    fn test_applicant_update_keeps_categories_separate() {
        let update = ApplicantScoreUpdate::from(&score("c1", 80.0));
        assert_eq!(update.job_fit_score, 80.0);
        assert_eq!(update.ai_analysis.education.gaps, vec!["no degree"]);
        let value = serde_json::to_value(&update.ai_analysis).unwrap();
        assert!(value.get("technicalSkills").is_some());
    }

    #[test]
    fn test_sort_by_score_desc() {
        let mut results: Vec<RankingResult> = [40.0, 92.5, 61.0]
            .iter()
            .enumerate()
            .map(|(i, s)| RankingResult::from(&score(&format!("c{i}"), *s)))
            .collect();
        sort_by_score_desc(&mut results);
        let scores: Vec<f64> = results.iter().map(|r| r.total_score).collect();
        assert_eq!(scores, vec![92.5, 61.0, 40.0]);
    }

    #[test]
    fn test_freshness_window_is_exclusive() {
        let six_hours = 6 * 3_600_000;
        let entry = RankingResultsEntry {
            timestamp: 1_000,
            results: vec![],
            total: 0,
            processed: 0,
        };
        assert!(entry.is_fresh_at(1_000 + six_hours - 1, six_hours));
        assert!(!entry.is_fresh_at(1_000 + six_hours, six_hours));
    }
}
