use crate::base::neterror::{ErrorClass, NetError};

#[test]
fn test_net_error_roundtrip() {
    // Standard Chromium error
    let original = NetError::ConnectionRefused;
    let code = original.as_i32();
    assert_eq!(code, -102);
    let converted = NetError::from(code);
    assert!(matches!(converted, NetError::ConnectionRefused));

    // Cancellation shares ERR_ABORTED
    assert_eq!(NetError::Cancelled.as_i32(), -3);
    assert_eq!(NetError::from(-3), NetError::Cancelled);

    // Custom error
    let custom = NetError::MalformedHeader;
    let custom_code = custom.as_i32();
    assert_eq!(custom_code, -10001);
    let custom_converted = NetError::from(custom_code);
    assert!(matches!(custom_converted, NetError::MalformedHeader));
}

#[test]
fn test_unknown_error() {
    let err = NetError::from(-9999);
    assert!(matches!(err, NetError::Unknown(-9999)));
    assert_eq!(err.as_i32(), -9999);
}

#[test]
fn test_collision_avoidance() {
    // Custom codes stay below every range defined in Chromium's net_error_list.h
    for err in [
        NetError::MalformedHeader,
        NetError::MultiplexerFailed,
        NetError::InvalidHeader,
    ] {
        assert!(err.as_i32() <= -10000);
    }
}

#[test]
fn test_error_classes() {
    assert_eq!(NetError::TimedOut.class(), ErrorClass::Transport);
    assert_eq!(NetError::NameNotResolved.class(), ErrorClass::Transport);
    assert_eq!(NetError::SslProtocolError.class(), ErrorClass::Transport);
    assert_eq!(NetError::InvalidHttpResponse.class(), ErrorClass::Protocol);
    assert_eq!(
        NetError::UploadStreamRewindNotSupported.class(),
        ErrorClass::Protocol
    );
    assert_eq!(NetError::Cancelled.class(), ErrorClass::Application);
    assert!(NetError::Cancelled.is_cancelled());
}
