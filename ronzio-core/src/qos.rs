use crate::error::Error;

/// MQTT quality of service level.
///
/// Ordered so that `min` picks the weaker of two levels, which is how the
/// effective QoS of a delivery is computed from the publish QoS and the
/// subscription QoS.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(n: u8) -> Result<Self, Error> {
        match n {
            0x00 => Ok(QoS::AtMostOnce),
            0x01 => Ok(QoS::AtLeastOnce),
            0x02 => Ok(QoS::ExactlyOnce),
            other => Err(Error::InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

#[cfg(test)]
mod tests {
    use super::QoS;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::try_from(0x00u8).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(0x01u8).unwrap(), QoS::AtLeastOnce);
        assert_eq!(QoS::try_from(0x02u8).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(0x03u8).is_err());
    }

    #[test]
    fn test_qos_min_downgrades() {
        assert_eq!(QoS::AtLeastOnce.min(QoS::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(QoS::ExactlyOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtLeastOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
    }
}
