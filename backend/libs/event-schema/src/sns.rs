/// SNS HTTP(S) subscription message types
///
/// Delivered by SNS to the live-update service's HTTP endpoint.
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum SnsParseError {
    #[error("SNS body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "Type")]
pub enum SnsHttpMessage {
    SubscriptionConfirmation {
        #[serde(rename = "TopicArn")]
        topic_arn: Option<String>,
        #[serde(rename = "Token")]
        token: Option<String>,
        #[serde(rename = "SubscribeURL")]
        subscribe_url: Option<String>,
    },
    Notification {
        #[serde(rename = "MessageId")]
        message_id: Option<String>,
        #[serde(rename = "Message", default)]
        message: String,
    },
    UnsubscribeConfirmation {
        #[serde(rename = "TopicArn")]
        topic_arn: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl SnsHttpMessage {
    pub fn parse(body: &str) -> Result<Self, SnsParseError> {
        Ok(serde_json::from_str(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscription_confirmation() {
        let body = r#"{"Type":"SubscriptionConfirmation","TopicArn":"arn:aws:sns:us-east-1:000000000000:processed-updates","Token":"tok"}"#;
        match SnsHttpMessage::parse(body).unwrap() {
            SnsHttpMessage::SubscriptionConfirmation { topic_arn, token, .. } => {
                assert_eq!(token.as_deref(), Some("tok"));
                assert!(topic_arn.unwrap().ends_with("processed-updates"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_notification() {
        let body = r#"{"Type":"Notification","MessageId":"m-1","Message":"{\"a\":1}"}"#;
        assert_eq!(
            SnsHttpMessage::parse(body).unwrap(),
            SnsHttpMessage::Notification {
                message_id: Some("m-1".to_string()),
                message: "{\"a\":1}".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_type() {
        let body = r#"{"Type":"SomethingElse"}"#;
        assert_eq!(SnsHttpMessage::parse(body).unwrap(), SnsHttpMessage::Unknown);
    }
}
