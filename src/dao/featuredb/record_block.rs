//! Flatbuffer tables streamed back by FeatureDB.
//!
//! ```text
//! table UInt8ValueColumn { value: [ubyte]; }
//! table RecordBlock { values: [UInt8ValueColumn]; }
//! table KKVData { pk: [ubyte]; sk: [ubyte]; value: [ubyte]; event_timestamp: long; play_time: double; }
//! table KKVRecordBlock { values: [KKVData]; }
//! ```

use flatbuffers::{
    ForwardsUOffset, InvalidFlatbuffer, Table, VOffsetT, Vector, Verifiable, Verifier,
};

use crate::error::{FeatureStoreError, Result};

macro_rules! fb_table {
    ($name: ident) => {
        #[derive(Copy, Clone, PartialEq)]
        pub struct $name<'a> {
            pub _tab: Table<'a>,
        }

        impl<'a> flatbuffers::Follow<'a> for $name<'a> {
            type Inner = $name<'a>;

            #[inline]
            unsafe fn follow(buf: &'a [u8], loc: usize) -> Self::Inner {
                Self {
                    _tab: Table::new(buf, loc),
                }
            }
        }
    };
}

fb_table!(UInt8ValueColumn);
fb_table!(RecordBlock);
fb_table!(KKVData);
fb_table!(KKVRecordBlock);

type Bytes<'a> = ForwardsUOffset<Vector<'a, u8>>;

impl<'a> UInt8ValueColumn<'a> {
    pub const VT_VALUE: VOffsetT = 4;

    pub fn value(&self) -> &'a [u8] {
        // SAFETY: the buffer was verified by `root`.
        unsafe { self._tab.get::<Bytes<'a>>(Self::VT_VALUE, None) }
            .map(|v| v.bytes())
            .unwrap_or_default()
    }
}

impl Verifiable for UInt8ValueColumn<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> std::result::Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<Bytes>("value", Self::VT_VALUE, false)?
            .finish();
        Ok(())
    }
}

impl<'a> RecordBlock<'a> {
    pub const VT_VALUES: VOffsetT = 4;

    pub fn values(&self) -> Option<Vector<'a, ForwardsUOffset<UInt8ValueColumn<'a>>>> {
        // SAFETY: the buffer was verified by `root`.
        unsafe {
            self._tab
                .get::<ForwardsUOffset<Vector<'a, ForwardsUOffset<UInt8ValueColumn>>>>(
                    Self::VT_VALUES,
                    None,
                )
        }
    }
}

impl Verifiable for RecordBlock<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> std::result::Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<Vector<'_, ForwardsUOffset<UInt8ValueColumn>>>>(
                "values",
                Self::VT_VALUES,
                false,
            )?
            .finish();
        Ok(())
    }
}

impl<'a> KKVData<'a> {
    pub const VT_PK: VOffsetT = 4;
    pub const VT_SK: VOffsetT = 6;
    pub const VT_VALUE: VOffsetT = 8;
    pub const VT_EVENT_TIMESTAMP: VOffsetT = 10;
    pub const VT_PLAY_TIME: VOffsetT = 12;

    fn bytes(&self, slot: VOffsetT) -> &'a [u8] {
        // SAFETY: the buffer was verified by `root`.
        unsafe { self._tab.get::<Bytes<'a>>(slot, None) }
            .map(|v| v.bytes())
            .unwrap_or_default()
    }

    pub fn pk(&self) -> &'a [u8] {
        self.bytes(Self::VT_PK)
    }

    pub fn sk(&self) -> &'a [u8] {
        self.bytes(Self::VT_SK)
    }

    pub fn value(&self) -> &'a [u8] {
        self.bytes(Self::VT_VALUE)
    }

    pub fn event_timestamp(&self) -> i64 {
        // SAFETY: the buffer was verified by `root`.
        unsafe { self._tab.get::<i64>(Self::VT_EVENT_TIMESTAMP, Some(0)) }.unwrap_or_default()
    }

    pub fn play_time(&self) -> f64 {
        // SAFETY: the buffer was verified by `root`.
        unsafe { self._tab.get::<f64>(Self::VT_PLAY_TIME, Some(0.0)) }.unwrap_or_default()
    }
}

impl Verifiable for KKVData<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> std::result::Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<Bytes>("pk", Self::VT_PK, false)?
            .visit_field::<Bytes>("sk", Self::VT_SK, false)?
            .visit_field::<Bytes>("value", Self::VT_VALUE, false)?
            .visit_field::<i64>("event_timestamp", Self::VT_EVENT_TIMESTAMP, false)?
            .visit_field::<f64>("play_time", Self::VT_PLAY_TIME, false)?
            .finish();
        Ok(())
    }
}

impl<'a> KKVRecordBlock<'a> {
    pub const VT_VALUES: VOffsetT = 4;

    pub fn values(&self) -> Option<Vector<'a, ForwardsUOffset<KKVData<'a>>>> {
        // SAFETY: the buffer was verified by `root`.
        unsafe {
            self._tab
                .get::<ForwardsUOffset<Vector<'a, ForwardsUOffset<KKVData>>>>(Self::VT_VALUES, None)
        }
    }
}

impl Verifiable for KKVRecordBlock<'_> {
    #[inline]
    fn run_verifier(v: &mut Verifier, pos: usize) -> std::result::Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<ForwardsUOffset<Vector<'_, ForwardsUOffset<KKVData>>>>(
                "values",
                Self::VT_VALUES,
                false,
            )?
            .finish();
        Ok(())
    }
}

pub fn root_as_record_block(buf: &[u8]) -> Result<RecordBlock<'_>> {
    flatbuffers::root::<RecordBlock>(buf)
        .map_err(|e| FeatureStoreError::decode(format!("invalid record block: {e}")))
}

pub fn root_as_kkv_record_block(buf: &[u8]) -> Result<KKVRecordBlock<'_>> {
    flatbuffers::root::<KKVRecordBlock>(buf)
        .map_err(|e| FeatureStoreError::decode(format!("invalid kkv record block: {e}")))
}
