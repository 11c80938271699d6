use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::models::Submission;

// Negative metrics carry an extra severity label shown next to the slider
// (e.g. "推诿指数").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub username: String,
    pub password: String,
    // Roster name this account submits as.
    pub name: String,
}

// Fixed inputs for one evaluation round: who rates whom, on which questions,
// with which credentials. Passed explicitly rather than looked up ambiently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    pub roster: Vec<String>,
    pub positive_metrics: Vec<MetricConfig>,
    pub negative_metrics: Vec<MetricConfig>,
    pub admin_password: String,
    pub accounts: Vec<UserAccount>,
}

pub const POS_MIN: f64 = 1.0;
pub const NEG_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;
pub const SCORE_STEP: f64 = 0.5;

impl EvalConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: EvalConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        if config.roster.len() < 2 {
            bail!("config roster needs at least two members");
        }
        Ok(config)
    }

    pub fn positive_questions(&self) -> Vec<&str> {
        self.positive_metrics.iter().map(|m| m.title.as_str()).collect()
    }

    pub fn negative_questions(&self) -> Vec<&str> {
        self.negative_metrics.iter().map(|m| m.title.as_str()).collect()
    }

    pub fn is_member(&self, name: &str) -> bool {
        self.roster.iter().any(|m| m == name)
    }

    // Everyone on the roster except the evaluator themselves.
    pub fn targets_for(&self, evaluator: &str) -> Vec<&str> {
        self.roster
            .iter()
            .filter(|m| m.as_str() != evaluator)
            .map(String::as_str)
            .collect()
    }

    pub fn find_account(&self, username: &str, password: &str) -> Option<&UserAccount> {
        self.accounts
            .iter()
            .find(|a| a.username == username && a.password == password)
    }

    // Rejects what the form could never produce: unknown roster names,
    // self-evaluation, unknown question keys, out-of-range or off-step scores.
    pub fn validate_submission(&self, submission: &Submission) -> anyhow::Result<()> {
        if !self.is_member(&submission.evaluator) {
            bail!("evaluator {:?} is not on the roster", submission.evaluator);
        }
        if !self.is_member(&submission.target) {
            bail!("target {:?} is not on the roster", submission.target);
        }
        if submission.evaluator == submission.target {
            bail!("{:?} cannot evaluate themselves", submission.evaluator);
        }
        for (question, &score) in &submission.pos_scores {
            if !self.positive_questions().contains(&question.as_str()) {
                bail!("unknown positive question {question:?}");
            }
            check_score(question, score, POS_MIN)?;
        }
        for (question, &score) in &submission.neg_scores {
            if !self.negative_questions().contains(&question.as_str()) {
                bail!("unknown negative question {question:?}");
            }
            check_score(question, score, NEG_MIN)?;
        }
        Ok(())
    }
}

fn check_score(question: &str, score: f64, min: f64) -> anyhow::Result<()> {
    if !(min..=SCORE_MAX).contains(&score) {
        bail!("score {score} for {question:?} outside [{min}, {SCORE_MAX}]");
    }
    if (score / SCORE_STEP).fract() != 0.0 {
        bail!("score {score} for {question:?} is not a multiple of {SCORE_STEP}");
    }
    Ok(())
}

// The 2026 KSI round, used when no config file is given.
pub fn builtin() -> EvalConfig {
    let roster: Vec<String> = [
        "史佳慧", "钱啸", "李倩", "郭建飞", "满懿", "徐美玲", "陈芳", "吴敏", "征胜男",
        "乔瑞丰", "李洁", "王泽群", "王青青", "赵璕", "蒋佩玉", "杨迪", "李双江",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();

    let positive_metrics = vec![
        metric(
            "1. 【专业壁垒】行业洞察与专业度",
            "打分项：是否对自己负责的领域（如孵化、产业、国际化、AI等）有极深的理解？是该领域的专家，能给团队和客户提供专业指引。",
            None,
        ),
        metric(
            "2. 【客户导向】尊重客户与服务意识",
            "打分项：是否真的把客户（政府/企业/创业者）放在第一位？在利益冲突时，是否能坚持长期主义，不忽悠，交付超预期的服务？",
            None,
        ),
        metric(
            "3. 【主动担当】责任心与补位意识",
            "打分项：面对公司模糊地带的工作或突发危机，是否能说“我来”，而不是“这不归我管”？",
            None,
        ),
        metric(
            "4. 【拥抱变化】创新与AI应用",
            "打分项：是否积极使用新工具（如AI）优化工作流？面对市场和政策变化，是否能快速调整策略，而不是死守旧经验？",
            None,
        ),
        metric(
            "5. 【团队凝聚】培养人与正能量",
            "打分项：团队氛围是否积极向上？是否在用心培养下属，而不是只把下属当工具人？",
            None,
        ),
        metric(
            "6. 【业绩结果】拿结果的能力",
            "打分项：无论过程多难，最终是否拿到了硬碰硬的业绩/交付成果？",
            None,
        ),
    ];

    let negative_metrics = vec![
        metric(
            "1. 【部门墙】推诿扯皮",
            "打分项：遇到跨部门协作时，是否习惯性防守、推责，只盯着自己的一亩三分地？",
            Some("“推诿指数”"),
        ),
        metric(
            "2. 【老油条】因循守旧",
            "打分项：对新事物（新模式/新要求）是否本能抵触？是否常挂在嘴边“以前都是这么干的”？",
            Some("“守旧指数”"),
        ),
        metric(
            "3. 【伪高管】只传话不落地",
            "打分项：是否只做“二传手”，把上面的压力原封不动传给下面，自己没有拆解策略，也没有解决实际困难？",
            Some("“悬空指数”"),
        ),
        metric(
            "4. 【情绪化】破坏团结",
            "打分项：是否在公开场合散布负面情绪，或对人不对事，搞小圈子？",
            Some("“负能量指数”"),
        ),
    ];

    let accounts = roster
        .iter()
        .enumerate()
        .map(|(i, name)| UserAccount {
            username: format!("ksi{:02}", i + 1),
            password: format!("ksi{:02}-2026", i + 1),
            name: name.clone(),
        })
        .collect();

    EvalConfig {
        roster,
        positive_metrics,
        negative_metrics,
        admin_password: "KSI2026".to_string(),
        accounts,
    }
}

fn metric(title: &str, description: &str, score_label: Option<&str>) -> MetricConfig {
    MetricConfig {
        title: title.to_string(),
        description: description.to_string(),
        score_label: score_label.map(str::to_owned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn submission(evaluator: &str, target: &str) -> Submission {
        Submission {
            evaluator: evaluator.to_string(),
            target: target.to_string(),
            pos_scores: HashMap::new(),
            neg_scores: HashMap::new(),
            text_start: String::new(),
            text_stop: String::new(),
            text_continue: String::new(),
        }
    }

    #[test]
    fn builtin_roster_and_questions() {
        let config = builtin();
        assert_eq!(config.roster.len(), 17);
        assert_eq!(config.positive_questions().len(), 6);
        assert_eq!(config.negative_questions().len(), 4);
        assert_eq!(config.targets_for("钱啸").len(), 16);
        assert!(!config.targets_for("钱啸").contains(&"钱啸"));
    }

    #[test]
    fn rejects_self_evaluation() {
        let config = builtin();
        let sub = submission("钱啸", "钱啸");
        assert!(config.validate_submission(&sub).is_err());
    }

    #[test]
    fn rejects_unknown_target() {
        let config = builtin();
        let sub = submission("钱啸", "nobody");
        assert!(config.validate_submission(&sub).is_err());
    }

    #[test]
    fn rejects_off_step_score() {
        let config = builtin();
        let mut sub = submission("钱啸", "李倩");
        let question = config.positive_questions()[0].to_string();
        sub.pos_scores.insert(question, 7.3);
        assert!(config.validate_submission(&sub).is_err());
    }

    #[test]
    fn accepts_valid_submission() {
        let config = builtin();
        let mut sub = submission("钱啸", "李倩");
        for q in config.positive_questions() {
            sub.pos_scores.insert(q.to_string(), 7.5);
        }
        for q in config.negative_questions() {
            sub.neg_scores.insert(q.to_string(), 2.0);
        }
        config.validate_submission(&sub).unwrap();
    }

    #[test]
    fn account_lookup_checks_both_fields() {
        let config = builtin();
        let account = &config.accounts[0];
        assert!(config
            .find_account(&account.username, &account.password)
            .is_some());
        assert!(config.find_account(&account.username, "wrong").is_none());
    }
}
