// SPDX-License-Identifier: GPL-3.0-only

//! Adapters from transport callbacks to splitter handlers
//!
//! Adapters only hold weak references. A callback that races with the
//! splitter (or the output) being dropped is silently ignored.

use super::SplitterInner;
use crate::transport::{FrameAvailableListener, ProducerListener, Transport};
use std::sync::Weak;
use tracing::trace;

/// Registered on the input consumer
pub(crate) struct InputListener<T: Transport> {
    splitter: Weak<SplitterInner<T>>,
}

impl<T: Transport> InputListener<T> {
    pub(crate) fn new(splitter: Weak<SplitterInner<T>>) -> Self {
        Self { splitter }
    }
}

impl<T: Transport> FrameAvailableListener for InputListener<T> {
    fn on_frame_available(&self) {
        if let Some(splitter) = self.splitter.upgrade() {
            splitter.on_frame_available();
        } else {
            trace!("Frame available after splitter was dropped");
        }
    }

    fn on_frame_replaced(&self) {
        // A replaced input frame is handled like a fresh one
        self.on_frame_available();
    }
}

/// Registered on each output surface
pub(crate) struct OutputListener<T: Transport> {
    splitter: Weak<SplitterInner<T>>,
    output: Weak<T::Output>,
}

impl<T: Transport> OutputListener<T> {
    pub(crate) fn new(splitter: Weak<SplitterInner<T>>, output: Weak<T::Output>) -> Self {
        Self { splitter, output }
    }
}

impl<T: Transport> ProducerListener for OutputListener<T> {
    fn on_buffer_released(&self) {
        let (Some(splitter), Some(output)) = (self.splitter.upgrade(), self.output.upgrade())
        else {
            return;
        };
        splitter.on_buffer_released_by_output(&output);
    }

    fn on_remote_died(&self) {
        let (Some(splitter), Some(output)) = (self.splitter.upgrade(), self.output.upgrade())
        else {
            return;
        };
        splitter.on_output_died(&output);
    }
}
