#![no_main]
use dicom_ulp::dimse::{fragment, Reassembler};
use dicom_ulp::pdu::Pdu;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u16, &[u8])| {
    let (maxlen, mut data) = data;

    // random presentation data values must never panic
    let mut reassembler = Reassembler::new([1, 3]);
    while let Ok(Some(Pdu::PData { data: values })) =
        dicom_ulp::pdu::read_pdu(&mut data, dicom_ulp::pdu::MAXIMUM_PDU_SIZE, false)
    {
        for value in values {
            match reassembler.push(value) {
                Ok(Some(message)) => {
                    // whatever was decoded survives another trip
                    let Ok(pdus) = fragment(&message, u32::from(maxlen)) else {
                        continue;
                    };
                    let mut again = Reassembler::new([message.presentation_context_id]);
                    let mut out = None;
                    for pdu in pdus {
                        let Pdu::PData { data } = pdu else {
                            panic!("fragments must be P-DATA-TF");
                        };
                        for value in data {
                            if let Some(m) = again.push(value).expect("fragments should reassemble") {
                                out = Some(m);
                            }
                        }
                    }
                    assert_eq!(out.as_ref(), Some(&message));
                }
                Ok(None) => {}
                Err(_) => return,
            }
        }
    }
});
