/// Declares an enum stored as a TEXT column.
///
/// Rows decode through `#[sqlx(try_from = "String")]` and binds go through
/// `as_str()`, so Postgres only ever sees plain strings.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        $vis enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            #[allow(dead_code)]
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub mod event;
pub mod package;
pub mod participant;
pub mod payment;
pub mod product;
pub mod refund;
pub mod service_team;

#[cfg(test)]
mod tests {
    use super::payment::PaymentStatus;
    use super::refund::RefundStatus;

    #[test]
    fn test_text_enum_round_trips_through_text() {
        for status in RefundStatus::ALL {
            assert_eq!(status.as_str().parse::<RefundStatus>(), Ok(*status));
        }
        assert_eq!(
            PaymentStatus::try_from("REFUND_PROCESSING".to_string()),
            Ok(PaymentStatus::RefundProcessing)
        );
        assert!("refunded".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_text_enum_serializes_as_column_text() {
        let json = serde_json::to_string(&RefundStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }
}
